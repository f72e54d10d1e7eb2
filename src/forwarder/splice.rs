//! Bidirectional byte copy with half-close, shared by the static forwarder
//! (TCP legs) and the tunnel data plane (visitor↔agent splice).

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

/// Byte counts copied in each direction: `(a_to_b, b_to_a)`.
pub struct SpliceResult {
    pub a_to_b: u64,
    pub b_to_a: u64,
}

/// Copy `a <-> b` until both directions have reached EOF, half-closing the
/// destination's write side as soon as a direction's source hits EOF so an
/// interactive peer (e.g. SSH) can still finish draining. Returns the first
/// non-EOF I/O error encountered by either direction, if any.
pub async fn splice(a: TcpStream, b: TcpStream) -> (SpliceResult, Option<std::io::Error>) {
    let (mut ar, mut aw) = a.into_split();
    let (mut br, mut bw) = b.into_split();

    let a_to_b = async move {
        let res = tokio::io::copy(&mut ar, &mut bw).await;
        let _ = bw.shutdown().await;
        res
    };
    let b_to_a = async move {
        let res = tokio::io::copy(&mut br, &mut aw).await;
        let _ = aw.shutdown().await;
        res
    };

    let (r1, r2) = tokio::join!(a_to_b, b_to_a);

    let a_to_b_bytes = r1.as_ref().ok().copied().unwrap_or(0);
    let b_to_a_bytes = r2.as_ref().ok().copied().unwrap_or(0);
    let err = r1.err().or_else(|| r2.err());

    (
        SpliceResult {
            a_to_b: a_to_b_bytes,
            b_to_a: b_to_a_bytes,
        },
        err,
    )
}
