// src/utils/streams.rs
use anyhow::{anyhow, Result};
use tokio::io::{AsyncRead, BufReader};
use tokio::process::Child;
use tokio_stream::wrappers::LinesStream;
use tokio_stream::{Stream, StreamExt};
use tokio::io::AsyncBufReadExt;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ChildStream {
    Stdout,
    Stderr,
}

/// Line stream over any async reader.
pub fn line_stream<R>(reader: R) -> impl Stream<Item = std::io::Result<String>>
where
    R: AsyncRead + Unpin,
{
    LinesStream::new(BufReader::new(reader).lines())
}

/// Collects one of a child's output streams line by line.
///
/// # Arguments
///
/// * `child` - Spawned child with the chosen stream piped.
/// * `stream` - Stdout or Stderr.
///
/// # Returns
/// All lines of the stream, without terminators.
pub async fn read_child_output_to_vec(child: &mut Child, stream: ChildStream) -> Result<Vec<String>> {
    let mut lines = Vec::new();
    match stream {
        ChildStream::Stdout => {
            let out = child.stdout.take().ok_or_else(|| anyhow!("Child stdout is not piped"))?;
            let mut s = line_stream(out);
            while let Some(line) = s.next().await {
                lines.push(line?);
            }
        }
        ChildStream::Stderr => {
            let err = child.stderr.take().ok_or_else(|| anyhow!("Child stderr is not piped"))?;
            let mut s = line_stream(err);
            while let Some(line) = s.next().await {
                lines.push(line?);
            }
        }
    }
    Ok(lines)
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Stdio;
    use tokio::process::Command;

    #[tokio::test]
    async fn test_read_child_stdout() -> Result<()> {
        let mut child = Command::new("bash")
            .args(["-c", "printf 'a\\nb\\n'"])
            .stdout(Stdio::piped())
            .spawn()?;
        let lines = read_child_output_to_vec(&mut child, ChildStream::Stdout).await?;
        child.wait().await?;
        assert_eq!(lines, vec!["a", "b"]);
        Ok(())
    }
}
