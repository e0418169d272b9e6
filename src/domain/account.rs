// Copyright (c) 2025 - Cowboy AI, Inc.
//! Account Contexts
//!
//! An account context is one authenticated (account, region) pair. Every
//! remote call runs against exactly one context; cross-account steps name
//! both sides explicitly.

use serde::{Deserialize, Serialize};

/// One authenticated account + region pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountContext {
    /// Logical name referenced by segments and zones
    pub name: String,
    pub account_id: String,
    pub region: String,
    /// Opaque handle resolved by the adapter (profile name, role ARN, ...)
    #[serde(default)]
    pub credential_ref: String,
}

impl AccountContext {
    pub fn new(
        name: impl Into<String>,
        account_id: impl Into<String>,
        region: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            account_id: account_id.into(),
            region: region.into(),
            credential_ref: String::new(),
        }
    }

    pub fn with_credential_ref(mut self, credential_ref: impl Into<String>) -> Self {
        self.credential_ref = credential_ref.into();
        self
    }
}
