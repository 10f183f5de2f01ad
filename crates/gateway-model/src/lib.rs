// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
pub mod error;
pub mod registry;
pub mod types;

pub use error::{ErrorKind, GatewayError};
pub use registry::ModelRegistry;
pub use types::{
    AlsContext, Citation, CompletionRequest, CompletionResponse, GroundingMode, Message, Role,
    ResponseMetadata, Usage, Vendor,
};
