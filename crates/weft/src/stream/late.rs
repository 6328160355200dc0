//! Ordered multiplexed channel for fragment bodies that land after the main
//! document.
//!
//! Async fragments attach here during template processing. Each attachment is
//! pumped by its own task into an unbounded buffer so a slow sub-stream never
//! stalls the others; the drain side emits each sub-stream contiguously, in
//! the order their first chunks arrived. Once the section is plugged no new
//! attachments are accepted, and the section ends when every attached
//! sub-stream has finished.

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::ComposeError;
use crate::fragment::FragmentOutcome;

/// A late sub-stream: the fragment's body plus the markers and fallback
/// content that wrap it in the output.
pub struct Attachment {
    /// Fragment index, for diagnostics.
    pub index: usize,
    /// Emitted before the first body byte.
    pub open: Bytes,
    /// Emitted after the last body byte.
    pub close: Bytes,
    /// Substituted body when the sub-stream fails.
    pub fallback: Bytes,
    pub body: mpsc::Receiver<Bytes>,
    pub outcome: tokio::sync::oneshot::Receiver<FragmentOutcome>,
}

/// Attach was called after the section was plugged.
#[derive(Debug, thiserror::Error)]
#[error("async section already plugged")]
pub struct SectionPlugged;

struct Announced {
    open: Bytes,
    close: Bytes,
    rx: mpsc::UnboundedReceiver<Bytes>,
}

struct SectionInner {
    // Keeps the announce channel open until plug(); after that the channel
    // closes once every attached producer has announced and finished.
    keeper: Option<mpsc::UnboundedSender<Announced>>,
    plugged: bool,
    attached: usize,
}

/// Producer half: owned by the template processor.
pub struct AsyncSection {
    inner: Arc<Mutex<SectionInner>>,
    token: CancellationToken,
}

/// Consumer half: drained into the composed output after the inline section.
pub struct SectionDrain {
    announce_rx: mpsc::UnboundedReceiver<Announced>,
}

impl AsyncSection {
    pub fn new(token: CancellationToken) -> (Self, SectionDrain) {
        let (announce_tx, announce_rx) = mpsc::unbounded_channel();
        let section = Self {
            inner: Arc::new(Mutex::new(SectionInner {
                keeper: Some(announce_tx),
                plugged: false,
                attached: 0,
            })),
            token,
        };
        (section, SectionDrain { announce_rx })
    }

    /// Register a late sub-stream. Fails once the section is plugged.
    pub fn attach(&self, attachment: Attachment) -> Result<(), SectionPlugged> {
        let announce_tx = {
            let mut inner = self.inner.lock();
            if inner.plugged {
                return Err(SectionPlugged);
            }
            inner.attached += 1;
            match &inner.keeper {
                Some(tx) => tx.clone(),
                None => return Err(SectionPlugged),
            }
        };

        tokio::spawn(pump(attachment, announce_tx, self.token.clone()));
        Ok(())
    }

    /// Declare that no more attachments will be made.
    pub fn plug(&self) {
        let mut inner = self.inner.lock();
        inner.plugged = true;
        inner.keeper.take();
        debug!(attached = inner.attached, "async section plugged");
    }
}

/// Copies one attachment's body into its buffer, announcing the attachment
/// when its first chunk (or terminal outcome) arrives.
async fn pump(
    mut attachment: Attachment,
    announce_tx: mpsc::UnboundedSender<Announced>,
    token: CancellationToken,
) {
    let (buf_tx, buf_rx) = mpsc::unbounded_channel();
    let mut pending = Some(Announced {
        open: attachment.open,
        close: attachment.close,
        rx: buf_rx,
    });

    let mut announce = |pending: &mut Option<Announced>| -> bool {
        match pending.take() {
            Some(ann) => announce_tx.send(ann).is_ok(),
            None => true,
        }
    };

    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            chunk = attachment.body.recv() => match chunk {
                Some(chunk) => {
                    if !announce(&mut pending) {
                        return;
                    }
                    if buf_tx.send(chunk).is_err() {
                        return;
                    }
                }
                None => break,
            },
        }
    }

    // Body channel closed: the terminal outcome decides whether the buffered
    // bytes stand or the fallback snippet is appended.
    let errored = match attachment.outcome.await {
        Ok(FragmentOutcome::Errored { .. }) => true,
        Ok(_) => false,
        // Fragment task went away without a terminal outcome (cancellation).
        Err(_) => return,
    };

    if !announce(&mut pending) {
        return;
    }
    if errored && !attachment.fallback.is_empty() {
        let _ = buf_tx.send(attachment.fallback);
    }
}

impl SectionDrain {
    /// Emit every announced sub-stream contiguously into `out`.
    ///
    /// Returns once all attached sub-streams have finished (or immediately if
    /// the section was plugged with none attached). A dropped consumer ends
    /// the drain instead of leaving it parked on a pending sub-stream.
    pub async fn drain(mut self, out: &mpsc::Sender<Bytes>) -> Result<(), ComposeError> {
        loop {
            let announced = tokio::select! {
                _ = out.closed() => return Err(ComposeError::Downstream),
                announced = self.announce_rx.recv() => announced,
            };
            let Some(mut announced) = announced else {
                return Ok(());
            };

            out.send(announced.open)
                .await
                .map_err(|_| ComposeError::Downstream)?;
            loop {
                let chunk = tokio::select! {
                    _ = out.closed() => return Err(ComposeError::Downstream),
                    chunk = announced.rx.recv() => chunk,
                };
                match chunk {
                    Some(chunk) => {
                        out.send(chunk).await.map_err(|_| ComposeError::Downstream)?
                    }
                    None => break,
                }
            }
            out.send(announced.close)
                .await
                .map_err(|_| ComposeError::Downstream)?;
        }
    }
}
