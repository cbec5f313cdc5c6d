//! File names derived from job ids

/// Encode a job id as a file name stem
///
/// ASCII letters, digits and `-` are kept. Every other byte, `_` included,
/// becomes `_` plus two lowercase hex digits, so distinct ids always give
/// distinct stems and the result never contains a path separator.
pub(crate) fn job_file_stem(job_id: &str) -> String {
    let mut stem = String::with_capacity(job_id.len());
    for byte in job_id.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' {
            stem.push(char::from(byte));
        } else {
            stem.push_str(&format!("_{byte:02x}"));
        }
    }
    stem
}
