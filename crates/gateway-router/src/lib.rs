// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The Router (C10) and Telemetry Emitter (C11) tying C1-C9 together.

pub mod build;
pub mod router;
pub mod telemetry;

pub use build::build_router;
pub use router::{Router, TimeoutConfig};
pub use telemetry::{build_record, TelemetryEmitter, TelemetryRecord};
