use crate::core::{UploadProgress, UploadStatus};

/// 格式化字节数
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    const UNIT_SIZE: f64 = 1024.0;

    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= UNIT_SIZE && unit_index < UNITS.len() - 1 {
        size /= UNIT_SIZE;
        unit_index += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_index])
}

/// One line summary of a snapshot, e.g. `clip.mp4 [uploading] 40.0% (4.00 MB / 10.00 MB, 4/10 chunks)`.
pub fn format_progress(progress: &UploadProgress) -> String {
    let status = match progress.status {
        UploadStatus::Pending => "pending",
        UploadStatus::Uploading => "uploading",
        UploadStatus::Paused => "paused",
        UploadStatus::Completed => "completed",
        UploadStatus::Error => "error",
    };

    let mut line = format!(
        "{} [{}] {:.1}% ({} / {}, {}/{} chunks)",
        progress.file_name,
        status,
        progress.percentage,
        format_bytes(progress.uploaded_size),
        format_bytes(progress.total_size),
        progress.uploaded_chunks,
        progress.total_chunks,
    );

    if let Some(error) = &progress.error {
        line.push_str(": ");
        line.push_str(error);
    }

    line
}
