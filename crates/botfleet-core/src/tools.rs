// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Registry of known agent tool names.
//!
//! Tools themselves are external plugins; the core only validates names at
//! config write time and passes the ordered list through to the engine.

use crate::error::CoreError;

/// Tool names the engine side knows how to wire up.
pub static KNOWN_TOOLS: &[&str] = &[
    "search",
    "math",
    "note",
    "rpg_dice",
    "content_extractor",
    "summarizer",
    "life_env",
];

/// Whether `name` is a registered tool.
pub fn is_known(name: &str) -> bool {
    KNOWN_TOOLS.contains(&name)
}

/// Validate an ordered tool list, preserving order. The first unrecognized
/// name fails the whole list.
pub fn validate(names: &[String]) -> Result<(), CoreError> {
    for name in names {
        if !is_known(name) {
            return Err(CoreError::UnknownTool(name.clone()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_tools() {
        assert!(is_known("search"));
        assert!(!is_known("telepathy"));
    }

    #[test]
    fn test_validate_rejects_first_unknown() {
        let names = vec!["search".to_string(), "telepathy".to_string()];
        assert!(matches!(
            validate(&names),
            Err(CoreError::UnknownTool(name)) if name == "telepathy"
        ));
        assert!(validate(&["math".to_string()]).is_ok());
        assert!(validate(&[]).is_ok());
    }
}
