//! Transmit side of a connection: write RET_SUBMIT and RET_UNLINK replies

use super::*;
use crate::connection::Shared;
use crate::usbip_protocol::{encode_ret_submit, encode_ret_unlink};

pub(crate) async fn tx_loop<W: AsyncWrite + Unpin>(shared: Arc<Shared>, mut writer: W) {
    loop {
        let (ready, unlinks) = take_outgoing(&shared);
        if ready.is_empty() && unlinks.is_empty() {
            if shared.is_stopping() {
                break;
            }
            tokio::select! {
                _ = shared.tx_wakeup() => continue,
                _ = shared.stopped() => break,
            }
        }

        let result = tokio::select! {
            _ = shared.stopped() => break,
            result = send_batch(&mut writer, ready, unlinks) => result,
        };
        if let Err(err) = result {
            if !shared.is_stopping() {
                warn!("[TX] Exiting: {}", err);
                shared.raise(err);
            }
            break;
        }
    }
    if let Err(err) = writer.shutdown().await {
        debug!("[TX] Shutdown: {}", err);
    }
    debug!("[TX] Stopped");
}

/// Take everything queued, in one critical section
fn take_outgoing(shared: &Shared) -> (Vec<ReadyTransfer>, Vec<UnlinkRequest>) {
    let mut queues = shared.queues();
    let ready = queues.ready.drain(..).collect();
    let unlinks = queues.unlinks.drain();
    (ready, unlinks)
}

/// RET_SUBMITs first, then RET_UNLINKs, then one flush
async fn send_batch<W: AsyncWrite + Unpin>(
    writer: &mut W,
    ready: Vec<ReadyTransfer>,
    unlinks: Vec<UnlinkRequest>,
) -> Result<()> {
    for transfer in ready {
        let seqnum = transfer.seqnum;
        let status = transfer.status;
        let bytes = encode_ret_submit(transfer)?;
        trace!("[TX] RET_SUBMIT seqnum {} status {}", seqnum, status);
        writer.write_all(&bytes).await?;
    }
    for request in unlinks {
        trace!(
            "[TX] RET_UNLINK seqnum {} status {}",
            request.seqnum,
            request.status
        );
        writer
            .write_all(&encode_ret_unlink(request.seqnum, request.status))
            .await?;
    }
    writer.flush().await?;
    Ok(())
}
