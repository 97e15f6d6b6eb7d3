//! Minimal Gopher client for `gopher://host[:port]/0/selector` text items.
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use url::Url;

use crate::error::FetchError;

const DEFAULT_PORT: u16 = 70;

/// Host, port and selector of a gopher item URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GopherUrl {
    pub host: String,
    pub port: u16,
    pub selector: String,
}

impl GopherUrl {
    pub fn parse(uri: &str) -> Result<Self, FetchError> {
        let url = Url::parse(uri).map_err(|e| FetchError::Gopher(format!("{uri}: {e}")))?;
        if url.scheme() != "gopher" {
            return Err(FetchError::Gopher(format!("{uri}: not a gopher url")));
        }
        let host = url
            .host_str()
            .ok_or_else(|| FetchError::Gopher(format!("{uri}: missing host")))?
            .to_owned();
        let port = url.port().unwrap_or(DEFAULT_PORT);

        // `/<type><selector>`; only text items make sense for feeds.
        let path = url.path();
        let selector = match path.strip_prefix("/").unwrap_or(path) {
            "" => String::new(),
            rest => match rest.strip_prefix('0') {
                Some(selector) => selector.to_owned(),
                None => return Err(FetchError::Gopher(format!("{uri}: not a text item"))),
            },
        };
        Ok(Self { host, port, selector })
    }
}

/// Fetch a gopher text item, reading at most `limit` bytes. Returns the body
/// and whether the limit was hit.
pub async fn fetch(uri: &str, limit: u64, timeout: Duration) -> Result<(Vec<u8>, bool), FetchError> {
    let target = GopherUrl::parse(uri)?;
    let io = async {
        let mut stream = TcpStream::connect((target.host.as_str(), target.port)).await?;
        stream.write_all(format!("{}\r\n", target.selector).as_bytes()).await?;

        let mut body = Vec::new();
        stream.take(limit + 1).read_to_end(&mut body).await?;
        Ok::<_, std::io::Error>(body)
    };
    let mut body = tokio::time::timeout(timeout, io)
        .await
        .map_err(|_| FetchError::Gopher(format!("{uri}: timed out")))??;

    let limited = body.len() as u64 > limit;
    body.truncate(limit as usize);
    // Text items may end with a lone `.` line.
    if body.ends_with(b"\r\n.\r\n") {
        body.truncate(body.len() - 3);
    } else if body.ends_with(b"\n.\n") {
        body.truncate(body.len() - 2);
    }
    if body.contains(&b'\r') {
        body = String::from_utf8_lossy(&body).replace("\r\n", "\n").into_bytes();
    }
    Ok((body, limited))
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncBufReadExt;
    use tokio::net::TcpListener;

    use super::*;

    #[test]
    fn parses_item_urls() {
        let url = GopherUrl::parse("gopher://example.org/0/~bob/twtxt.txt").unwrap();
        assert_eq!(url.host, "example.org");
        assert_eq!(url.port, 70);
        assert_eq!(url.selector, "/~bob/twtxt.txt");

        let url = GopherUrl::parse("gopher://example.org:7070/0twtxt.txt").unwrap();
        assert_eq!((url.port, url.selector.as_str()), (7070, "twtxt.txt"));

        assert!(GopherUrl::parse("gopher://example.org/1/menu").is_err());
        assert!(GopherUrl::parse("https://example.org/0/x").is_err());
    }

    #[tokio::test]
    async fn fetches_text_item() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut stream = tokio::io::BufReader::new(stream);
            let mut line = String::new();
            stream.read_line(&mut line).await.unwrap();
            assert_eq!(line, "/twtxt.txt\r\n");
            stream
                .get_mut()
                .write_all(b"2021-01-01T00:00:00Z\thello from gopher\r\n.\r\n")
                .await
                .unwrap();
        });

        let (body, limited) = fetch(
            &format!("gopher://127.0.0.1:{port}/0/twtxt.txt"),
            1024,
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        assert!(!limited);
        assert_eq!(body, b"2021-01-01T00:00:00Z\thello from gopher\n");
    }
}
