//! Command output.
//!
//! Results go to stdout as pretty JSON so they can be piped into other
//! tools; logs stay on stderr.

use anyhow::Context;
use serde::Serialize;

/// Renders a value as pretty JSON.
pub fn render<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<String> {
    serde_json::to_string_pretty(value).context("Failed to serialize command output")
}

/// Prints a value as pretty JSON on stdout.
pub fn print_json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", render(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use dbgateway_core::{ConnectionTest, EngineError};

    use super::*;

    #[test]
    fn test_render_failed_connection_test() {
        let test = ConnectionTest::failed(EngineError::Timeout("after 10s".to_string()));
        let json: serde_json::Value = serde_json::from_str(&render(&test).unwrap()).unwrap();

        assert_eq!(json["success"], false);
        assert_eq!(json["errorKind"], "timeout");
    }

    #[test]
    fn test_render_is_pretty() {
        let text = render(&serde_json::json!({"deleted": true})).unwrap();
        assert!(text.contains('\n'));
    }
}
