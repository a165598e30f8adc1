use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use uuid::Uuid;

/// Re-log every line an executor writes on one of its output streams.
///
/// Bytes are not interpreted: lines that are not valid UTF-8 are logged
/// lossily and reading goes on until the stream closes. Returns the number
/// of lines seen.
pub async fn drain<R>(job_id: Uuid, stream: &'static str, reader: R) -> usize
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    let mut count = 0usize;

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                count += 1;
                let line = String::from_utf8_lossy(trim_newline(&buf));
                tracing::info!(target: "executor", job_id = %job_id, stream, "{}", line);
            }
            Err(e) => {
                tracing::debug!(job_id = %job_id, stream, error = %e, "Executor output closed");
                break;
            }
        }
    }

    count
}

fn trim_newline(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}
