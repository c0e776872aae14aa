//! Message transport
//!
//! A [`Link`] is one end of an ordered, bidirectional envelope channel.
//! Links come from an in-process pair or from any byte stream through the
//! frame codec. The [`host::Host`] serves links on the privileged side;
//! [`crate::client::EventClient`] drives them on the caller side.

pub mod codec;
pub mod frame;
pub mod host;
#[cfg(unix)]
pub mod unix;

use crate::error::GatewayError;
use crate::protocol::{Envelope, Response};
use codec::{FrameReader, FrameWriter};
use frame::{Frame, FrameType};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

/// Non-blocking envelope sink, usable from provider delivery callbacks
pub type EnvelopeSender = mpsc::UnboundedSender<Envelope>;
pub type EnvelopeReceiver = mpsc::UnboundedReceiver<Envelope>;

/// One end of an envelope channel
#[derive(Debug)]
pub struct Link {
    pub tx: EnvelopeSender,
    pub rx: EnvelopeReceiver,
}

impl Link {
    /// Two connected in-process ends
    pub fn pair() -> (Link, Link) {
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();
        (Link { tx: a_tx, rx: a_rx }, Link { tx: b_tx, rx: b_rx })
    }

    /// Bridge a byte stream into a link
    ///
    /// Spawns a reader task (frames to envelopes) and a writer task
    /// (envelopes to frames). The link's receiver ends when the peer closes
    /// or sends garbage; the writer sends a close frame once every sender of
    /// this link is dropped. An envelope over `max_payload` is not sent:
    /// responses are answered with a transport error instead, anything else
    /// is dropped. Only I/O failures end the writer.
    pub fn framed<R, W>(reader: R, writer: W, max_payload: u32) -> Link
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (local, remote) = Link::pair();
        let Link {
            tx: inbound,
            rx: mut outbound,
        } = remote;

        tokio::spawn(async move {
            let mut reader = FrameReader::with_max_payload(reader, max_payload);
            loop {
                let frame = match reader.read_frame().await {
                    Ok(Some(frame)) => frame,
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(error = %e, "Framed link read failed");
                        break;
                    }
                };

                match frame.frame_type {
                    FrameType::Data => match Envelope::from_bytes(&frame.payload) {
                        Ok(envelope) => {
                            if inbound.send(envelope).is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "Dropping malformed envelope");
                        }
                    },
                    FrameType::Heartbeat => {}
                    FrameType::Error => {
                        tracing::warn!(
                            error = %String::from_utf8_lossy(&frame.payload),
                            "Peer reported link error"
                        );
                        break;
                    }
                    FrameType::Close => break,
                }
            }
            tracing::debug!("Framed link reader finished");
        });

        tokio::spawn(async move {
            let mut writer = FrameWriter::with_max_payload(writer, max_payload);
            while let Some(envelope) = outbound.recv().await {
                let Some(payload) = fit_payload(&envelope, max_payload) else {
                    continue;
                };
                if let Err(e) = writer.write_frame(&Frame::data(payload)).await {
                    tracing::warn!(error = %e, "Framed link write failed");
                    return;
                }
            }
            let _ = writer.write_frame(&Frame::close()).await;
            let _ = writer.shutdown().await;
            tracing::debug!("Framed link writer finished");
        });

        local
    }

    pub fn into_parts(self) -> (EnvelopeSender, EnvelopeReceiver) {
        (self.tx, self.rx)
    }
}

/// Serialized payload of `envelope`, or a substitute when it is too large
fn fit_payload(envelope: &Envelope, max_payload: u32) -> Option<Vec<u8>> {
    let payload = match envelope.to_bytes() {
        Ok(payload) => payload,
        Err(e) => {
            tracing::warn!(error = %e, "Dropping unserializable envelope");
            return None;
        }
    };
    if payload.len() <= max_payload as usize {
        return Some(payload);
    }

    let size = payload.len();
    match envelope {
        Envelope::Response(response) => {
            tracing::warn!(
                request_id = %response.id,
                size,
                max_payload,
                "Response exceeds frame limit, answering with an error"
            );
            let error = GatewayError::Transport(format!(
                "response of {} bytes exceeds the {} byte frame limit",
                size, max_payload
            ));
            Envelope::Response(Response::err(response.id.clone(), &error))
                .to_bytes()
                .ok()
                .filter(|p| p.len() <= max_payload as usize)
        }
        _ => {
            tracing::warn!(size, max_payload, "Dropping envelope over frame limit");
            None
        }
    }
}
