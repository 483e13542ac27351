//! HMAC-SHA-256 over ciphertext: one-shot tags, a verifying stream tee for
//! downloads, and the sequential accumulator used by the multipart
//! coordinator.
//!
//! The HMAC key is the DEK itself: the DEK is per-object and already
//! protected by the KEK, so integrity-key distribution piggybacks on the
//! envelope with no extra key schedule.

use super::CryptoError;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::Stream;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::pin::Pin;
use std::task::{Context, Poll};
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// HMAC-SHA-256 tag length in bytes.
pub const HMAC_TAG_LEN: usize = 32;

fn new_mac(key: &[u8]) -> HmacSha256 {
    HmacSha256::new_from_slice(key).expect("HMAC accepts keys of any length")
}

/// One-shot tag over a buffered ciphertext.
pub fn hmac_tag(key: &[u8], data: &[u8]) -> [u8; HMAC_TAG_LEN] {
    let mut mac = new_mac(key);
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// Constant-time tag comparison.
pub fn verify_tag(expected: &[u8], actual: &[u8]) -> bool {
    expected.len() == actual.len() && expected.ct_eq(actual).into()
}

/// Stream tee that accumulates an HMAC over every chunk it passes through
/// and verifies the stored tag at EOF.
///
/// Bytes are forwarded before the tag can be checked, so a mismatch
/// surfaces as a terminal stream error: if response headers were already
/// flushed the connection aborts mid-body, which is the strongest signal
/// available to an HTTP/1.1 client.
pub struct HmacVerifyStream {
    inner: BoxStream<'static, Result<Bytes, CryptoError>>,
    mac: Option<HmacSha256>,
    expected_tag: Vec<u8>,
    finished: bool,
}

impl HmacVerifyStream {
    pub fn new(
        inner: BoxStream<'static, Result<Bytes, CryptoError>>,
        key: &[u8],
        expected_tag: Vec<u8>,
    ) -> Self {
        Self {
            inner,
            mac: Some(new_mac(key)),
            expected_tag,
            finished: false,
        }
    }
}

impl Stream for HmacVerifyStream {
    type Item = Result<Bytes, CryptoError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.finished {
            return Poll::Ready(None);
        }
        match Pin::new(&mut self.inner).poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                if let Some(mac) = self.mac.as_mut() {
                    mac.update(&chunk);
                }
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(e))) => {
                self.finished = true;
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                self.finished = true;
                let mac = self.mac.take().expect("mac consumed once at EOF");
                let tag = mac.finalize().into_bytes();
                if verify_tag(&self.expected_tag, &tag) {
                    Poll::Ready(None)
                } else {
                    Poll::Ready(Some(Err(CryptoError::IntegrityFailure)))
                }
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Sequential multipart accumulator.
///
/// `update_sequential` enforces strictly increasing part numbers starting at
/// 1; the multipart coordinator is responsible for buffering out-of-order
/// arrivals and replaying them in order. Sealed state never rewinds, which
/// is what makes re-upload of an already-sealed part impossible.
pub struct SequentialHmac {
    mac: HmacSha256,
    expected_next_part: u32,
}

impl SequentialHmac {
    pub fn new(key: &[u8]) -> Self {
        Self {
            mac: new_mac(key),
            expected_next_part: 1,
        }
    }

    /// The part number the accumulator will accept next.
    pub fn expected_next_part(&self) -> u32 {
        self.expected_next_part
    }

    /// Fold part `part_number`'s ciphertext into the running tag. Fails on
    /// any part number other than the expected one.
    pub fn update_sequential(&mut self, part_number: u32, ciphertext: &[u8]) -> Result<(), CryptoError> {
        if part_number != self.expected_next_part {
            return Err(CryptoError::InvalidEnvelope(format!(
                "HMAC accumulator expected part {}, got {}",
                self.expected_next_part, part_number
            )));
        }
        self.mac.update(ciphertext);
        self.expected_next_part += 1;
        Ok(())
    }

    /// Finalize the accumulated tag.
    pub fn finalize(self) -> [u8; HMAC_TAG_LEN] {
        self.mac.finalize().into_bytes().into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[test]
    fn test_one_shot_tag_deterministic() {
        let a = hmac_tag(b"key", b"ciphertext");
        let b = hmac_tag(b"key", b"ciphertext");
        assert_eq!(a, b);
        assert_ne!(a, hmac_tag(b"key", b"ciphertext!"));
        assert_ne!(a, hmac_tag(b"other", b"ciphertext"));
    }

    #[test]
    fn test_verify_tag_rejects_length_mismatch() {
        let tag = hmac_tag(b"k", b"data");
        assert!(verify_tag(&tag, &tag));
        assert!(!verify_tag(&tag[..16], &tag));
    }

    #[test]
    fn test_sequential_matches_one_shot() {
        let parts: Vec<&[u8]> = vec![b"alpha", b"beta", b"gamma"];
        let mut seq = SequentialHmac::new(b"dek");
        for (i, part) in parts.iter().enumerate() {
            seq.update_sequential(i as u32 + 1, part).unwrap();
        }
        let concat: Vec<u8> = parts.concat();
        assert_eq!(seq.finalize(), hmac_tag(b"dek", &concat));
    }

    #[test]
    fn test_sequential_idempotent_across_runs() {
        let run = || {
            let mut seq = SequentialHmac::new(b"dek");
            seq.update_sequential(1, b"part-one").unwrap();
            seq.update_sequential(2, b"part-two").unwrap();
            seq.finalize()
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn test_sequential_rejects_out_of_order() {
        let mut seq = SequentialHmac::new(b"dek");
        assert!(seq.update_sequential(2, b"x").is_err());
        seq.update_sequential(1, b"x").unwrap();
        assert!(seq.update_sequential(1, b"x").is_err());
        assert!(seq.update_sequential(3, b"x").is_err());
        seq.update_sequential(2, b"y").unwrap();
        assert_eq!(seq.expected_next_part(), 3);
    }

    #[tokio::test]
    async fn test_verify_stream_accepts_valid_tag() {
        let data = b"streamed ciphertext body".to_vec();
        let tag = hmac_tag(b"dek", &data);
        let chunks: Vec<Result<Bytes, CryptoError>> = data
            .chunks(7)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        let mut stream =
            HmacVerifyStream::new(futures::stream::iter(chunks).boxed(), b"dek", tag.to_vec());

        let mut out = Vec::new();
        while let Some(item) = stream.next().await {
            out.extend_from_slice(&item.unwrap());
        }
        assert_eq!(out, data);
    }

    #[tokio::test]
    async fn test_verify_stream_errors_on_forged_tag() {
        let data = b"streamed ciphertext body".to_vec();
        let mut tag = hmac_tag(b"dek", &data).to_vec();
        tag[0] ^= 0xFF;
        let chunks: Vec<Result<Bytes, CryptoError>> =
            vec![Ok(Bytes::from(data))];
        let mut stream =
            HmacVerifyStream::new(futures::stream::iter(chunks).boxed(), b"dek", tag);

        // The payload chunk is delivered, then EOF surfaces the failure.
        assert!(stream.next().await.unwrap().is_ok());
        let last = stream.next().await.unwrap();
        assert!(matches!(last, Err(CryptoError::IntegrityFailure)));
        assert!(stream.next().await.is_none());
    }
}
