use std::path::{Component, Path};

use sharevault_protocol::TransferKind;

use crate::TransferError;
use crate::types::TransferRequest;

/// Validates that a file name is a single, plain path segment.
///
/// Rejects:
/// - Empty names
/// - Names containing `/` or `\`
/// - `.` and `..`
/// - Null bytes
pub fn validate_file_name(file_name: &str) -> Result<(), TransferError> {
    if file_name.is_empty() {
        return Err(TransferError::Validation("empty file name".into()));
    }
    if file_name.contains(['/', '\\']) {
        return Err(TransferError::Validation(format!(
            "file name must not contain path separators: {file_name}"
        )));
    }
    if file_name.contains('\0') {
        return Err(TransferError::Validation("file name contains a null byte".into()));
    }

    let mut components = Path::new(file_name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(()),
        _ => Err(TransferError::Validation(format!(
            "not a plain file name: {file_name}"
        ))),
    }
}

/// Checks a request before any task or reservation exists.
///
/// `source_size` is the size of the file the transfer reads from: the local
/// file for uploads, the sandbox file for downloads.
pub fn validate_request(request: &TransferRequest, source_size: u64) -> Result<(), TransferError> {
    validate_file_name(&request.file_name)?;

    if request.local_path.as_os_str().is_empty() {
        return Err(TransferError::Validation("empty local path".into()));
    }

    if source_size != request.total_size {
        let what = match request.kind {
            TransferKind::Upload => "local file",
            TransferKind::Download => "sandbox file",
        };
        return Err(TransferError::Validation(format!(
            "{what} is {source_size} bytes, declared {}",
            request.total_size
        )));
    }

    Ok(())
}
