use std::path::Path;

use serde::Serialize;

use crate::models::{UploadConstraints, UploadRequest};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationError {
    pub code: &'static str,
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for ValidationError {}

/// Outcome of the pre-flight checks
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationOutcome {
    pub valid: bool,
    pub error: Option<ValidationError>,
}

impl ValidationOutcome {
    pub fn into_result(self) -> Result<(), ValidationError> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Runs every pre-flight check in order and stops at the first failure.
///
/// Pure and synchronous: nothing here touches the network or the session.
pub fn validate(request: &UploadRequest, constraints: &UploadConstraints) -> ValidationOutcome {
    let result = validate_non_empty(request.size())
        .and_then(|_| validate_file_size(request.size(), constraints.max_file_size))
        .and_then(|_| {
            let mime = effective_mime_type(&request.mime_type, &request.data)?;
            validate_mime_type(&mime, &constraints.allowed_mimes)
        });

    match result {
        Ok(()) => ValidationOutcome {
            valid: true,
            error: None,
        },
        Err(err) => {
            tracing::debug!("Validation rejected {}: {}", request.original_name, err);
            ValidationOutcome {
                valid: false,
                error: Some(err),
            }
        }
    }
}

pub fn validate_non_empty(size: usize) -> Result<(), ValidationError> {
    if size == 0 {
        return Err(ValidationError {
            code: "EMPTY_FILE",
            message: "File is empty".to_string(),
        });
    }
    Ok(())
}

/// Validates file size against maximum limit
pub fn validate_file_size(size: usize, max_size: usize) -> Result<(), ValidationError> {
    if size > max_size {
        return Err(ValidationError {
            code: "FILE_TOO_LARGE",
            message: format!(
                "File size {} bytes exceeds maximum allowed {} bytes ({} MB)",
                size,
                max_size,
                max_size / 1024 / 1024
            ),
        });
    }
    Ok(())
}

/// Validates MIME type against allowlist
pub fn validate_mime_type(content_type: &str, allowed: &[String]) -> Result<(), ValidationError> {
    let normalized = normalize_mime(content_type);

    if allowed
        .iter()
        .any(|candidate| normalize_mime(candidate) == normalized)
    {
        return Ok(());
    }

    Err(ValidationError {
        code: "INVALID_MIME_TYPE",
        message: format!(
            "MIME type '{}' is not allowed. Accepted: {}",
            content_type,
            allowed.join(", ")
        ),
    })
}

/// Lowercased essence of a MIME type, with browser aliases folded in
pub fn normalize_mime(content_type: &str) -> String {
    let essence = content_type
        .parse::<mime::Mime>()
        .map(|m| m.essence_str().to_string())
        .unwrap_or_else(|_| {
            content_type
                .split(';')
                .next()
                .unwrap_or("")
                .trim()
                .to_string()
        })
        .to_lowercase();

    match essence.as_str() {
        "image/jpg" | "image/pjpeg" => "image/jpeg".to_string(),
        "image/x-png" => "image/png".to_string(),
        _ => essence,
    }
}

/// Declared type, or the sniffed one when the caller only knew "some bytes".
///
/// A declared image type that the magic bytes contradict is rejected.
pub fn effective_mime_type(declared: &str, data: &[u8]) -> Result<String, ValidationError> {
    let declared = normalize_mime(declared);
    let sniffed = infer::get(data).map(|kind| kind.mime_type().to_string());

    if declared.is_empty() || declared == mime::APPLICATION_OCTET_STREAM.essence_str() {
        return sniffed.ok_or_else(|| ValidationError {
            code: "UNKNOWN_TYPE",
            message: "Could not determine the file type".to_string(),
        });
    }

    if let Some(sniffed) = sniffed {
        if declared.starts_with("image/") && sniffed.starts_with("image/") && sniffed != declared
        {
            return Err(ValidationError {
                code: "TYPE_MISMATCH",
                message: format!("File claims to be {} but contains {}", declared, sniffed),
            });
        }
    }

    Ok(declared)
}

/// Object-key safe version of a user supplied file name
pub fn sanitize_filename(filename: &str) -> String {
    // Strip any directory part, including Windows separators
    let last = filename.rsplit(['/', '\\']).next().unwrap_or("");
    let name = Path::new(last)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("");

    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        let mapped = if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
            c
        } else {
            '_'
        };
        if mapped == '_' && out.ends_with('_') {
            continue;
        }
        out.push(mapped);
    }

    let trimmed = out.trim_matches(|c| c == '_' || c == '.');
    if trimmed.is_empty() {
        "file".to_string()
    } else {
        trimmed.to_string()
    }
}
