//! Bidirectional byte copying between two streams.

use std::io;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

/// Which copy direction ended a splice
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpliceEnd {
    /// `a` reached end of stream first
    AToB,
    /// `b` reached end of stream first
    BToA,
}

/// Copy bytes both ways between `a` and `b` until either direction ends,
/// then close both streams.
///
/// Bytes are never inspected. Returns the direction that finished and the
/// bytes it copied.
///
/// # Errors
///
/// Returns the I/O error that ended the splice.
pub async fn splice<A, B>(a: A, b: B) -> io::Result<(SpliceEnd, u64)>
where
    A: AsyncRead + AsyncWrite,
    B: AsyncRead + AsyncWrite,
{
    let (mut a_rd, mut a_wr) = tokio::io::split(a);
    let (mut b_rd, mut b_wr) = tokio::io::split(b);

    let result = tokio::select! {
        r = tokio::io::copy(&mut a_rd, &mut b_wr) => r.map(|n| (SpliceEnd::AToB, n)),
        r = tokio::io::copy(&mut b_rd, &mut a_wr) => r.map(|n| (SpliceEnd::BToA, n)),
    };

    let _ = a_wr.shutdown().await;
    let _ = b_wr.shutdown().await;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_bytes_pass_both_ways() {
        let (mut left, a) = tokio::io::duplex(1024);
        let (b, mut right) = tokio::io::duplex(1024);
        let task = tokio::spawn(splice(a, b));

        left.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        right.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        right.write_all(b"pong").await.unwrap();
        left.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        drop(left);
        let (end, copied) = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(end, SpliceEnd::AToB);
        assert_eq!(copied, 4);
    }

    #[tokio::test]
    async fn test_closing_one_side_closes_the_other() {
        let (left, a) = tokio::io::duplex(1024);
        let (b, mut right) = tokio::io::duplex(1024);
        let task = tokio::spawn(splice(a, b));

        drop(left);
        let mut rest = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), right.read_to_end(&mut rest))
            .await
            .unwrap()
            .unwrap();
        assert!(rest.is_empty());
        task.await.unwrap().unwrap();
    }
}
