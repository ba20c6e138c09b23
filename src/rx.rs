//! Receive side of a connection: parse commands and hand URBs to the local stack

use super::*;
use crate::connection::Shared;
use crate::usbip_protocol::{CmdSubmit, CmdUnlink, UsbIpCommand};

pub(crate) async fn rx_loop<R: AsyncRead + Unpin>(shared: Arc<Shared>, mut reader: R) {
    let is_iso_pipe = |ep: u32, direction: Direction| {
        ep <= MAX_ENDPOINT_NUMBER
            && shared
                .stack
                .endpoint(ep as u8, direction)
                .map_or(false, |endpoint| endpoint.kind() == TransferKind::Isochronous)
    };
    loop {
        let command = tokio::select! {
            _ = shared.stopped() => break,
            command = UsbIpCommand::read_from_socket(&mut reader, &shared.config, &is_iso_pipe) => {
                command
            }
        };

        let result = command.and_then(|command| {
            trace!("[RX] Got command: {:?}", command.header());
            handle_command(&shared, command)
        });
        if let Err(err) = result {
            if shared.is_stopping() {
                break;
            }
            if err.is_disconnect() {
                info!("[RX] Remote closed the connection");
            } else {
                warn!("[RX] Exiting: {}", err);
            }
            shared.raise(err);
            break;
        }
    }
    debug!("[RX] Stopped");
}

fn handle_command(shared: &Arc<Shared>, command: UsbIpCommand) -> Result<()> {
    let devid = command.header().devid;
    if shared.config.check_devid && devid != shared.devid {
        return Err(ProtocolError::InvalidDevid {
            expected: shared.devid,
            got: devid,
        }
        .into());
    }

    match command {
        UsbIpCommand::Submit(cmd) => handle_submit(shared, cmd),
        UsbIpCommand::Unlink(cmd) => {
            handle_unlink(shared, cmd);
            Ok(())
        }
    }
}

fn handle_submit(shared: &Arc<Shared>, cmd: CmdSubmit) -> Result<()> {
    let seqnum = cmd.header.seqnum;
    let direction = direction_from_wire(cmd.header.direction)?;
    let ep = cmd.header.ep;
    let endpoint = if ep <= MAX_ENDPOINT_NUMBER {
        shared.stack.endpoint(ep as u8, direction)
    } else {
        None
    };
    let endpoint = endpoint.ok_or(ProtocolError::InvalidEndpoint { ep, direction })?;
    let kind = endpoint.kind();

    let length = cmd.transfer_buffer_length as usize;
    if kind == TransferKind::Isochronous {
        for (index, packet) in cmd.iso_packets.iter().enumerate() {
            if packet.offset as u64 + packet.length as u64 > length as u64 {
                return Err(ProtocolError::InvalidIsoPacket { index }.into());
            }
        }
    }

    let transfer_flags = mask_transfer_flags(cmd.transfer_flags, kind, direction);
    if transfer_flags != cmd.transfer_flags {
        debug!(
            "[RX] seqnum {}: transfer_flags {:#x} masked to {:#x}",
            seqnum, cmd.transfer_flags, transfer_flags
        );
    }

    let chunk = shared.config.sg_chunk_size.max(1);
    let num_parts = if kind == TransferKind::Bulk && !shared.stack.supports_sg() && length > chunk
    {
        shared.config.split_parts(length)
    } else {
        1
    };

    // every buffer is allocated before the transfer becomes visible
    let mut urbs = Vec::with_capacity(num_parts);
    let mut data = cmd.data;
    let mut iso_packets = cmd.iso_packets;
    for part in 0..num_parts {
        let (start, end) = if num_parts == 1 {
            (0, length)
        } else {
            (part * chunk, ((part + 1) * chunk).min(length))
        };
        let buffer = match direction {
            Direction::Out if num_parts == 1 => std::mem::take(&mut data),
            Direction::Out => data[start..end].to_vec(),
            Direction::In => alloc_buffer(end - start)?,
        };
        urbs.push(Urb {
            id: UrbId { seqnum, part },
            endpoint: endpoint.number(),
            direction,
            kind,
            transfer_flags,
            setup: cmd.setup,
            buffer,
            actual_length: 0,
            status: status::EINPROGRESS,
            start_frame: cmd.start_frame,
            interval: cmd.interval,
            error_count: 0,
            iso_packets: std::mem::take(&mut iso_packets),
        });
    }

    {
        let mut queues = shared.queues();
        // checked under the lock so teardown either sees this entry or we see it
        if shared.is_stopping() {
            debug!("[RX] Dropping seqnum {}, connection is stopping", seqnum);
            return Ok(());
        }
        queues
            .table
            .insert(seqnum, TransferExecutor::new(seqnum, direction, kind, num_parts))?;
    }
    trace!(
        "[RX] seqnum {}: {:?} {:?} ep{} len {} in {} part(s)",
        seqnum,
        kind,
        direction,
        ep,
        length,
        num_parts
    );

    let mut submitted = Vec::with_capacity(num_parts);
    for urb in urbs {
        let id = urb.id;
        if let Err(source) = shared.stack.submit(urb, shared.completion(id)) {
            warn!(
                "[RX] Local stack rejected seqnum {} part {}: {}",
                seqnum, id.part, source
            );
            shared.queues().table.take(seqnum);
            for id in submitted {
                shared.stack.cancel(id);
            }
            return Err(StubError::LocalStack { seqnum, source });
        }
        submitted.push(id);
    }

    // Teardown takes its cancel snapshot under the queue lock after setting
    // the stop flag. Either that snapshot came after our submits, or we see
    // the flag here and cancel ourselves.
    let stopping = {
        let _queues = shared.queues();
        shared.is_stopping()
    };
    if stopping {
        debug!("[RX] Stopped while submitting seqnum {}, cancelling", seqnum);
        for id in submitted {
            shared.stack.cancel(id);
        }
    }
    Ok(())
}

fn handle_unlink(shared: &Arc<Shared>, cmd: CmdUnlink) {
    let seqnum = cmd.header.seqnum;
    let target = cmd.unlink_seqnum;

    let mut queues = shared.queues();
    let to_cancel = match queues.table.get_mut(target) {
        Some(executor) if executor.is_unlinking() => {
            debug!("[RX] seqnum {} is already being unlinked", target);
            None
        }
        Some(executor) => Some(executor.mark_unlinking(seqnum)),
        None => None,
    };

    match to_cancel {
        Some(to_cancel) => {
            drop(queues);
            trace!("[RX] Unlinking seqnum {} for {}", target, seqnum);
            for id in to_cancel {
                shared.stack.cancel(id);
            }
        }
        None => {
            // already answered, or never seen
            trace!("[RX] Late unlink of seqnum {} by {}", target, seqnum);
            queues.unlinks.enqueue(seqnum, target, status::OK);
            drop(queues);
            shared.wake_tx();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usbip_protocol::{IsoPacketDescriptor, UsbIpReply};
    use crate::util::tests::*;

    const DEVID: u32 = 2;

    #[tokio::test(flavor = "multi_thread")]
    async fn foreign_devid_is_fatal() {
        setup_test_logger();
        let stack = MockStack::new();
        let (mut client, server) = tokio::io::duplex(4096);
        let connection = Connection::start(server, DEVID, stack.clone(), StubConfig::default());

        client
            .write_all(&cmd_submit(DEVID + 1, 1, Direction::In, 1, 8, vec![]))
            .await
            .unwrap();
        assert!(matches!(
            connection.fatal_error().await,
            StubError::Protocol(ProtocolError::InvalidDevid {
                expected: DEVID,
                got: 3
            })
        ));
        assert_eq!(stack.submitted(), 0);
        connection.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn foreign_devid_accepted_when_unchecked() {
        setup_test_logger();
        let stack = MockStack::new();
        let (mut client, server) = tokio::io::duplex(4096);
        let config = StubConfig {
            check_devid: false,
            ..StubConfig::default()
        };
        let connection = Connection::start(server, DEVID, stack.clone(), config);

        client
            .write_all(&cmd_submit(0xdead, 1, Direction::In, 1, 8, vec![]))
            .await
            .unwrap();
        stack.wait_submitted(1).await;
        connection.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unknown_endpoint_is_fatal() {
        setup_test_logger();
        for (ep, direction) in [(7, Direction::In), (16, Direction::Out), (2, Direction::Out)] {
            let stack = MockStack::new();
            let (mut client, server) = tokio::io::duplex(4096);
            let connection =
                Connection::start(server, DEVID, stack.clone(), StubConfig::default());

            client
                .write_all(&cmd_submit(DEVID, 1, direction, ep, 0, vec![]))
                .await
                .unwrap();
            match connection.fatal_error().await {
                StubError::Protocol(ProtocolError::InvalidEndpoint { ep: got, .. }) => {
                    assert_eq!(got, ep)
                }
                other => panic!("unexpected {:?}", other),
            }
            assert_eq!(stack.submitted(), 0);
            connection.shutdown().await;
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn transfer_flags_are_masked() {
        setup_test_logger();
        let stack = MockStack::new();
        let (mut client, server) = tokio::io::duplex(4096);
        let connection = Connection::start(server, DEVID, stack.clone(), StubConfig::default());

        let mut cmd = submit_cmd(DEVID, 1, Direction::In, 1, 8, vec![]);
        cmd.transfer_flags = urb_flags::URB_SHORT_NOT_OK | urb_flags::URB_ZERO_PACKET | 0x8000;
        client
            .write_all(&UsbIpCommand::Submit(cmd).to_bytes())
            .await
            .unwrap();
        stack.wait_submitted(1).await;
        assert_eq!(stack.flags_of(1, 0), Some(urb_flags::URB_SHORT_NOT_OK));
        connection.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn out_data_is_split_across_parts() {
        setup_test_logger();
        let stack = MockStack::without_sg();
        let (mut client, server) = tokio::io::duplex(4096);
        let config = StubConfig {
            sg_chunk_size: 4,
            ..StubConfig::default()
        };
        let connection = Connection::start(server, DEVID, stack.clone(), config);

        let data: Vec<u8> = (0..10).collect();
        client
            .write_all(&cmd_submit(DEVID, 4, Direction::Out, 1, 10, data))
            .await
            .unwrap();
        stack.wait_submitted(3).await;
        assert_eq!(stack.buffer_of(4, 0), Some(vec![0, 1, 2, 3]));
        assert_eq!(stack.buffer_of(4, 1), Some(vec![4, 5, 6, 7]));
        assert_eq!(stack.buffer_of(4, 2), Some(vec![8, 9]));

        for part in 0..3 {
            stack.complete(4, part, status::OK, &[]);
        }
        match UsbIpReply::read_from_socket(&mut client, |_| Direction::Out)
            .await
            .unwrap()
        {
            UsbIpReply::Submit(ret) => {
                assert_eq!(ret.header.seqnum, 4);
                assert_eq!(ret.actual_length, 10);
            }
            other => panic!("expected RET_SUBMIT, got {:?}", other),
        }
        connection.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn interrupt_transfers_are_never_split() {
        setup_test_logger();
        let stack = MockStack::without_sg();
        let (mut client, server) = tokio::io::duplex(4096);
        let config = StubConfig {
            sg_chunk_size: 4,
            ..StubConfig::default()
        };
        let connection = Connection::start(server, DEVID, stack.clone(), config);

        client
            .write_all(&cmd_submit(DEVID, 1, Direction::In, 2, 64, vec![]))
            .await
            .unwrap();
        stack.wait_submitted(1).await;
        assert_eq!(stack.buffer_of(1, 0).map(|b| b.len()), Some(64));
        assert_eq!(connection.pending_transfers(), 1);
        connection.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn packet_count_on_bulk_pipe_keeps_stream_in_sync() {
        setup_test_logger();
        let stack = MockStack::new();
        let (mut client, server) = tokio::io::duplex(4096);
        let connection = Connection::start(server, DEVID, stack.clone(), StubConfig::default());

        let mut cmd = submit_cmd(DEVID, 1, Direction::In, 1, 64, vec![]);
        cmd.number_of_packets = 3;
        client
            .write_all(&UsbIpCommand::Submit(cmd).to_bytes())
            .await
            .unwrap();
        client
            .write_all(&cmd_submit(DEVID, 2, Direction::In, 2, 8, vec![]))
            .await
            .unwrap();
        stack.wait_submitted(2).await;
        assert_eq!(connection.pending_transfers(), 2);
        assert!(connection.is_running());
        connection.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn iso_packet_outside_buffer_is_fatal() {
        setup_test_logger();
        let stack = MockStack::new();
        let (mut client, server) = tokio::io::duplex(4096);
        let connection = Connection::start(server, DEVID, stack.clone(), StubConfig::default());

        let mut cmd = submit_cmd(DEVID, 1, Direction::In, 3, 16, vec![]);
        cmd.number_of_packets = 2;
        cmd.iso_packets = vec![
            IsoPacketDescriptor {
                offset: 0,
                length: 8,
                actual_length: 0,
                status: 0,
            },
            IsoPacketDescriptor {
                offset: 8,
                length: 16,
                actual_length: 0,
                status: 0,
            },
        ];
        client
            .write_all(&UsbIpCommand::Submit(cmd).to_bytes())
            .await
            .unwrap();
        assert!(matches!(
            connection.fatal_error().await,
            StubError::Protocol(ProtocolError::InvalidIsoPacket { index: 1 })
        ));
        connection.shutdown().await;
    }
}
