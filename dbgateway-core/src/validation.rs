//! Input validation for connection drafts, updates and identifiers.
//!
//! Validators collect every problem they find into a list of
//! [`FieldError`]s instead of stopping at the first one.

use std::sync::OnceLock;

use regex::Regex;

use crate::error::{FieldError, GatewayError};
use crate::models::{ConnectionDraft, ConnectionSummary, ConnectionUpdate, EngineFamily};

const MAX_NAME_LEN: usize = 255;

fn identifier_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^[a-zA-Z_][a-zA-Z0-9_]*$").ok())
        .as_ref()
}

fn blank(value: Option<&String>) -> bool {
    value.is_none_or(|v| v.trim().is_empty())
}

fn finish(errors: Vec<FieldError>) -> crate::Result<()> {
    if errors.is_empty() {
        Ok(())
    } else {
        Err(GatewayError::validation(errors))
    }
}

/// Target fields whose presence is dictated by the engine family.
struct TargetFields<'a> {
    host: Option<&'a String>,
    port: Option<u16>,
    database: Option<&'a String>,
    username: Option<&'a String>,
    file_path: Option<&'a String>,
}

/// File engines take only a file path; network engines take host,
/// database and username and never a file path.
fn target_shape_errors(family: EngineFamily, fields: TargetFields<'_>, errors: &mut Vec<FieldError>) {
    if family.is_file_based() {
        if blank(fields.file_path) {
            errors.push(FieldError::new("filePath", "required for sqlite connections"));
        }
        for (field, present) in [
            ("host", fields.host.is_some()),
            ("port", fields.port.is_some()),
            ("databaseName", fields.database.is_some()),
            ("username", fields.username.is_some()),
        ] {
            if present {
                errors.push(FieldError::new(field, "not allowed for sqlite connections"));
            }
        }
    } else {
        for (field, value) in [
            ("host", fields.host),
            ("databaseName", fields.database),
            ("username", fields.username),
        ] {
            if blank(value) {
                errors.push(FieldError::new(
                    field,
                    format!("required for {family} connections"),
                ));
            }
        }
        if fields.file_path.is_some() {
            errors.push(FieldError::new(
                "filePath",
                format!("not allowed for {family} connections"),
            ));
        }
    }
}

/// Validates a connection draft before it is tested or stored.
///
/// # Errors
/// Returns `GatewayError::Validation` listing every offending field
pub fn validate_draft(draft: &ConnectionDraft) -> crate::Result<()> {
    let mut errors = Vec::new();

    if draft.owner_id.trim().is_empty() {
        errors.push(FieldError::new("ownerId", "must not be empty"));
    }

    let name = draft.name.trim();
    if name.is_empty() {
        errors.push(FieldError::new("name", "must not be empty"));
    } else if name.chars().count() > MAX_NAME_LEN {
        errors.push(FieldError::new(
            "name",
            format!("must be at most {MAX_NAME_LEN} characters"),
        ));
    }

    target_shape_errors(
        draft.family,
        TargetFields {
            host: draft.host.as_ref(),
            port: draft.port,
            database: draft.database.as_ref(),
            username: draft.username.as_ref(),
            file_path: draft.file_path.as_ref(),
        },
        &mut errors,
    );
    if draft.port == Some(0) && !draft.family.is_file_based() {
        errors.push(FieldError::new("port", "must be between 1 and 65535"));
    }

    finish(errors)
}

/// Validates a partial update against the family of the stored record.
///
/// Emptiness is not checked here; the registry reports an empty update as
/// `NoFieldsToUpdate`.
///
/// # Errors
/// Returns `GatewayError::Validation` listing every offending field
pub fn validate_update(family: EngineFamily, update: &ConnectionUpdate) -> crate::Result<()> {
    let mut errors = Vec::new();

    for (field, value) in [
        ("name", update.name.as_ref()),
        ("host", update.host.as_ref()),
        ("databaseName", update.database.as_ref()),
        ("username", update.username.as_ref()),
        ("filePath", update.file_path.as_ref()),
    ] {
        if value.is_some() && blank(value) {
            errors.push(FieldError::new(field, "must not be empty"));
        }
    }

    if update.name.as_ref().is_some_and(|n| n.trim().chars().count() > MAX_NAME_LEN) {
        errors.push(FieldError::new(
            "name",
            format!("must be at most {MAX_NAME_LEN} characters"),
        ));
    }

    if update.port == Some(0) {
        errors.push(FieldError::new("port", "must be between 1 and 65535"));
    }

    if family.is_file_based() {
        for (field, present) in [
            ("host", update.host.is_some()),
            ("port", update.port.is_some()),
            ("databaseName", update.database.is_some()),
            ("username", update.username.is_some()),
        ] {
            if present {
                errors.push(FieldError::new(field, "not allowed for sqlite connections"));
            }
        }
    } else if update.file_path.is_some() {
        errors.push(FieldError::new(
            "filePath",
            format!("not allowed for {family} connections"),
        ));
    }

    finish(errors)
}

/// Validates the target fields of a stored record against its family.
///
/// The registry runs this on the row produced by an update, before the
/// write is committed.
///
/// # Errors
/// Returns `GatewayError::Validation` listing every offending field
pub fn validate_stored(summary: &ConnectionSummary) -> crate::Result<()> {
    let mut errors = Vec::new();
    target_shape_errors(
        summary.engine_family,
        TargetFields {
            host: summary.host.as_ref(),
            port: summary.port,
            database: summary.database_name.as_ref(),
            username: summary.username.as_ref(),
            file_path: summary.file_path.as_ref(),
        },
        &mut errors,
    );
    finish(errors)
}

/// Checks that a table name is a plain identifier safe to splice into SQL.
///
/// # Errors
/// Returns `GatewayError::Validation` for anything else
pub fn validate_table_name(table: &str) -> crate::Result<()> {
    if identifier_pattern().is_some_and(|pattern| pattern.is_match(table)) {
        Ok(())
    } else {
        Err(GatewayError::invalid_field("tableName", "Invalid table name"))
    }
}
