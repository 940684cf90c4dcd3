//! Integration tests: drive the connection manager against simulated devices.
//!
//! Each test connects a [`FakeDevice`] of one protocol family and exercises the
//! full submit → encode → transport → decode → reply path, including the state
//! machine's recovery behavior.

#[cfg(test)]
mod tests {
    use crate::config::{CoreConfig, CoreContext};
    use crate::connection::{ConnectionConfig, ConnectionManager, ConnectionState, StateEvent};
    use crate::error::Error;
    use crate::macros::{
        DeviceAction, MacroBuilder, MacroPlayer, MouseButton, PlaybackTarget, PlayerConfig,
    };
    use crate::profile::{apply_profile, ButtonAction, DeviceProfile, PollingRate};
    use crate::protocol::razer::RazerCodec;
    use crate::protocol::{Capability, ProtocolCommand};
    use crate::registry::{pids, vids, DeviceId, EnumeratedDevice, Registry};
    use crate::transport::mock::FakeDevice;
    use crate::transport::TransportKind;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::broadcast;

    const WAIT: Duration = Duration::from_secs(5);

    fn fast_config() -> CoreConfig {
        CoreConfig {
            connection: ConnectionConfig {
                probe_timeout_ms: 200,
                command_timeout_ms: 200,
                backoff_base_ms: 1,
                reconnect_delay_ms: 1,
                queue_depth: 128,
                ..ConnectionConfig::default()
            },
            ..CoreConfig::default()
        }
    }

    fn manager(fake: &FakeDevice) -> Arc<ConnectionManager> {
        manager_with(fake, fast_config().connection)
    }

    fn manager_with(fake: &FakeDevice, connection: ConnectionConfig) -> Arc<ConnectionManager> {
        let config = CoreConfig {
            connection,
            ..fast_config()
        };
        Arc::new(ConnectionManager::new(
            Arc::new(Registry::builtin()),
            fake.opener(),
            CoreContext::new(config),
        ))
    }

    fn device(vendor_id: u16, product_id: u16) -> EnumeratedDevice {
        EnumeratedDevice {
            vendor_id,
            product_id,
            path: format!("fake-{vendor_id:04x}-{product_id:04x}"),
        }
    }

    fn deathadder() -> EnumeratedDevice {
        device(vids::RAZER, pids::DEATHADDER_V2)
    }

    async fn next_event(rx: &mut broadcast::Receiver<StateEvent>) -> StateEvent {
        tokio::time::timeout(WAIT, rx.recv())
            .await
            .expect("state event within timeout")
            .expect("event channel open")
    }

    async fn states(rx: &mut broadcast::Receiver<StateEvent>, n: usize) -> Vec<ConnectionState> {
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            out.push(next_event(rx).await.to);
        }
        out
    }

    async fn connected(
        fake: &FakeDevice,
        dev: &EnumeratedDevice,
    ) -> (Arc<ConnectionManager>, DeviceId) {
        let mgr = manager(fake);
        let id = mgr.connect(dev).await.unwrap();
        (mgr, id)
    }

    #[tokio::test]
    async fn connect_reaches_connected_and_reports_adapter() {
        let fake = FakeDevice::new();
        let mgr = manager(&fake);
        let mut events = mgr.subscribe();

        let id = mgr.connect(&deathadder()).await.unwrap();
        assert_eq!(mgr.state(&id), ConnectionState::Connected);
        assert_eq!(
            states(&mut events, 2).await,
            vec![ConnectionState::Probing, ConnectionState::Connected]
        );
        let adapter = mgr.adapter(&id).unwrap();
        assert!(adapter.capabilities().contains(Capability::Dpi));
        assert_eq!(fake.opens(), vec![TransportKind::VendorHid]);
        mgr.disconnect(&id).await.unwrap();
    }

    #[tokio::test]
    async fn second_connect_is_already_connected() {
        let fake = FakeDevice::new();
        let (mgr, id) = connected(&fake, &deathadder()).await;

        let err = mgr.connect(&deathadder()).await.unwrap_err();
        assert!(matches!(err, Error::AlreadyConnected(_)));
        assert_eq!(fake.live_transports(), 1);
        mgr.disconnect(&id).await.unwrap();
    }

    #[tokio::test]
    async fn unknown_device_is_not_found() {
        let fake = FakeDevice::new();
        let mgr = manager(&fake);
        let err = mgr.connect(&device(0x1234, 0x0001)).await.unwrap_err();
        assert!(matches!(err, Error::DeviceNotFound(_)));
        assert!(fake.opens().is_empty());
    }

    #[tokio::test]
    async fn probe_falls_back_to_next_transport() {
        let fake = FakeDevice::new();
        fake.refuse(TransportKind::VendorHid);
        let (mgr, id) = connected(&fake, &deathadder()).await;

        assert_eq!(
            fake.opens(),
            vec![TransportKind::VendorHid, TransportKind::GenericHid]
        );
        assert_eq!(mgr.state(&id), ConnectionState::Connected);
        mgr.disconnect(&id).await.unwrap();
    }

    #[tokio::test]
    async fn probe_failure_on_every_transport_is_connection_failed() {
        let fake = FakeDevice::new();
        for kind in [TransportKind::VendorHid, TransportKind::GenericHid, TransportKind::RawUsb] {
            fake.refuse(kind);
        }
        let mgr = manager(&fake);
        let dev = deathadder();
        let err = mgr.connect(&dev).await.unwrap_err();
        assert!(matches!(err, Error::ConnectionFailed { .. }));
        assert_eq!(mgr.state(&dev.id()), ConnectionState::Disconnected);

        // The failed worker cleaned up, so a retry is allowed.
        fake.accept_all();
        let id = mgr.connect(&dev).await.unwrap();
        assert_eq!(mgr.state(&id), ConnectionState::Connected);
        mgr.disconnect(&id).await.unwrap();
    }

    #[tokio::test]
    async fn failures_degrade_then_reconnect() {
        let fake = FakeDevice::new();
        let mgr = manager(&fake);
        let mut events = mgr.subscribe();
        let id = mgr.connect(&deathadder()).await.unwrap();

        fake.fail_next_writes(3);
        let cmd = mgr.adapter(&id).unwrap().set_dpi(1600).unwrap();
        let err = mgr.execute(&id, cmd.clone()).await.unwrap_err();
        assert!(matches!(err, Error::Hid(_)), "got {err}");

        assert_eq!(
            states(&mut events, 5).await,
            vec![
                ConnectionState::Probing,
                ConnectionState::Connected,
                ConnectionState::Degraded,
                ConnectionState::Reconnecting,
                ConnectionState::Connected,
            ]
        );

        let result = mgr.execute(&id, cmd).await.unwrap();
        assert!(result.is_ok());
        let metrics = mgr.metrics(&id).unwrap();
        assert_eq!(metrics.reconnect_count, 1);
        assert_eq!(metrics.error_count, 3);
        assert!(metrics.last_error.is_some());
        mgr.disconnect(&id).await.unwrap();
    }

    #[tokio::test]
    async fn single_failure_recovers_without_reconnect() {
        let fake = FakeDevice::new();
        let mgr = manager(&fake);
        let mut events = mgr.subscribe();
        let id = mgr.connect(&deathadder()).await.unwrap();

        fake.fail_next_writes(1);
        let cmd = mgr.adapter(&id).unwrap().set_dpi(800).unwrap();
        assert!(mgr.execute(&id, cmd).await.unwrap().is_ok());
        assert_eq!(
            states(&mut events, 4).await,
            vec![
                ConnectionState::Probing,
                ConnectionState::Connected,
                ConnectionState::Degraded,
                ConnectionState::Connected,
            ]
        );
        assert_eq!(mgr.metrics(&id).unwrap().reconnect_count, 0);
        mgr.disconnect(&id).await.unwrap();
    }

    #[tokio::test]
    async fn swallowed_response_times_out_and_retries() {
        let fake = FakeDevice::new();
        let (mgr, id) = connected(&fake, &deathadder()).await;

        fake.swallow_next_responses(1);
        let cmd = mgr.adapter(&id).unwrap().set_polling_rate(500).unwrap();
        assert!(mgr.execute(&id, cmd).await.unwrap().is_ok());
        let metrics = mgr.metrics(&id).unwrap();
        assert_eq!(metrics.error_count, 1);
        assert!(metrics.last_error.unwrap().contains("timeout"));
        mgr.disconnect(&id).await.unwrap();
    }

    #[tokio::test]
    async fn corrupted_checksum_is_protocol_error() {
        let fake = FakeDevice::new();
        let (mgr, id) = connected(&fake, &deathadder()).await;

        fake.corrupt_next_responses(1);
        let cmd = mgr.adapter(&id).unwrap().set_dpi(1200).unwrap();
        let err = mgr.execute(&id, cmd).await.unwrap_err();
        match err {
            Error::Protocol { reason, context } => {
                assert!(reason.contains("checksum"), "{reason}");
                assert_eq!(context.device_id.as_deref(), Some(id.as_str()));
                assert_eq!(context.attempt, 1);
            }
            other => panic!("expected protocol error, got {other}"),
        }
        mgr.disconnect(&id).await.unwrap();
    }

    #[tokio::test]
    async fn split_responses_are_reassembled() {
        let fake = FakeDevice::new();
        fake.split_responses(16);
        let (mgr, id) = connected(&fake, &device(vids::STEELSERIES, pids::RIVAL_310)).await;

        let cmd = mgr.adapter(&id).unwrap().set_dpi(1600).unwrap();
        assert!(mgr.execute(&id, cmd).await.unwrap().is_ok());
        mgr.disconnect(&id).await.unwrap();
    }

    #[tokio::test]
    async fn concurrent_submissions_resolve_in_fifo_order() {
        let fake = FakeDevice::new();
        let (mgr, id) = connected(&fake, &deathadder()).await;
        let adapter = mgr.adapter(&id).unwrap();
        let before = fake.written().len();
        let order = Arc::new(tokio::sync::Mutex::new(Vec::new()));

        let mut tasks = Vec::new();
        for t in 0..4u16 {
            let (mgr, id, adapter, order) =
                (mgr.clone(), id.clone(), adapter.clone(), order.clone());
            tasks.push(tokio::spawn(async move {
                let mut pending = Vec::new();
                for i in 0..25u16 {
                    let dpi = 100 + 50 * (t * 25 + i);
                    let cmd = adapter.set_dpi(dpi).unwrap();
                    let mut log = order.lock().await;
                    pending.push(mgr.submit(&id, cmd.clone()).unwrap());
                    log.push(cmd);
                    drop(log);
                    tokio::task::yield_now().await;
                }
                for fut in pending {
                    assert!(fut.await.unwrap().is_ok());
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let order = order.lock().await;
        let written = fake.written();
        assert_eq!(written.len() - before, 100);
        for (frame, cmd) in written[before..].iter().zip(order.iter()) {
            assert_eq!(frame, &adapter.encode_command(cmd).unwrap());
        }
        mgr.disconnect(&id).await.unwrap();
    }

    #[tokio::test]
    async fn unsolicited_reports_are_published() {
        let fake = FakeDevice::new();
        let (mgr, id) = connected(&fake, &deathadder()).await;
        let mut reports = mgr.subscribe_reports();

        let event = RazerCodec::new(0xFF)
            .encode(&ProtocolCommand::new(
                Capability::Identify,
                0x0B01,
                vec![3],
                0,
                crate::protocol::ChecksumKind::Xor,
            ))
            .unwrap();
        fake.push_event(event);

        let cmd = mgr.adapter(&id).unwrap().set_dpi(400).unwrap();
        assert!(mgr.execute(&id, cmd).await.unwrap().is_ok());

        let report = tokio::time::timeout(WAIT, reports.recv()).await.unwrap().unwrap();
        assert_eq!(report.device_id, id);
        assert_eq!(report.event.opcode, 0x0B01);
        assert_eq!(report.event.payload, vec![3]);
        mgr.disconnect(&id).await.unwrap();
    }

    #[tokio::test]
    async fn disconnect_releases_transport_and_is_idempotent() {
        let fake = FakeDevice::new();
        let (mgr, id) = connected(&fake, &deathadder()).await;
        assert_eq!(fake.live_transports(), 1);

        mgr.disconnect(&id).await.unwrap();
        assert_eq!(fake.live_transports(), 0);
        assert_eq!(mgr.state(&id), ConnectionState::Disconnected);
        mgr.disconnect(&id).await.unwrap();

        let cmd = ProtocolCommand::new(
            Capability::Dpi,
            0x0405,
            vec![],
            90,
            crate::protocol::ChecksumKind::Xor,
        );
        assert!(matches!(mgr.submit(&id, cmd), Err(Error::DeviceNotFound(_))));
    }

    #[tokio::test]
    async fn reconnect_during_disconnect_never_doubles_the_handle() {
        let fake = FakeDevice::new();
        let dev = deathadder();
        let (mgr, mut id) = connected(&fake, &dev).await;

        for _ in 0..50 {
            let (gone, again) = tokio::join!(mgr.disconnect(&id), mgr.connect(&dev));
            gone.unwrap();
            id = match again {
                Ok(id) => id,
                Err(Error::AlreadyConnected(_)) => mgr.connect(&dev).await.unwrap(),
                Err(other) => panic!("unexpected connect error: {other}"),
            };
            assert_eq!(mgr.state(&id), ConnectionState::Connected);
        }
        assert_eq!(fake.max_live_transports(), 1);
        mgr.disconnect(&id).await.unwrap();
        assert_eq!(fake.live_transports(), 0);
    }

    #[tokio::test]
    async fn submit_while_disconnecting_is_connection_failed() {
        let fake = FakeDevice::new();
        let (mgr, id) = connected(&fake, &deathadder()).await;
        let cmd = mgr.adapter(&id).unwrap().set_dpi(800).unwrap();

        let disconnect = {
            let (mgr, id) = (mgr.clone(), id.clone());
            tokio::spawn(async move { mgr.disconnect(&id).await })
        };
        // Let the disconnect start before submitting.
        for _ in 0..3 {
            tokio::task::yield_now().await;
        }
        match mgr.submit(&id, cmd) {
            Err(Error::ConnectionFailed { .. }) | Err(Error::DeviceNotFound(_)) => {}
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("a disconnecting device accepted a command"),
        }
        disconnect.await.unwrap().unwrap();
        assert_eq!(fake.live_transports(), 0);
    }

    #[tokio::test]
    async fn commands_queued_across_reconnect_keep_fifo_order() {
        let fake = FakeDevice::new();
        let mgr = manager_with(
            &fake,
            ConnectionConfig {
                backoff_base_ms: 20,
                ..fast_config().connection
            },
        );
        let id = mgr.connect(&deathadder()).await.unwrap();
        let adapter = mgr.adapter(&id).unwrap();

        fake.fail_next_writes(3);
        let failing = mgr.submit(&id, adapter.set_dpi(400).unwrap()).unwrap();
        let dpis = [800u16, 1200, 1600, 2000];
        let commands: Vec<_> = dpis.iter().map(|dpi| adapter.set_dpi(*dpi).unwrap()).collect();
        let pending: Vec<_> = commands
            .iter()
            .map(|cmd| mgr.submit(&id, cmd.clone()).unwrap())
            .collect();

        assert!(matches!(failing.await, Err(Error::Hid(_))));
        for reply in pending {
            assert!(reply.await.unwrap().is_ok());
        }
        assert_eq!(mgr.metrics(&id).unwrap().reconnect_count, 1);

        let frames: Vec<Vec<u8>> = commands
            .iter()
            .map(|cmd| adapter.encode_command(cmd).unwrap())
            .collect();
        let order: Vec<usize> = fake
            .written()
            .iter()
            .filter_map(|w| frames.iter().position(|f| f == w))
            .collect();
        assert_eq!(order, vec![0, 1, 2, 3]);
        mgr.disconnect(&id).await.unwrap();
    }

    #[tokio::test]
    async fn requeue_overflow_is_dropped() {
        let fake = FakeDevice::new();
        let mgr = manager_with(
            &fake,
            ConnectionConfig {
                backoff_base_ms: 20,
                requeue_depth: 2,
                ..fast_config().connection
            },
        );
        let id = mgr.connect(&deathadder()).await.unwrap();
        let adapter = mgr.adapter(&id).unwrap();

        fake.fail_next_writes(3);
        let failing = mgr.submit(&id, adapter.set_dpi(400).unwrap()).unwrap();
        let pending: Vec<_> = (1..=5u16)
            .map(|n| mgr.submit(&id, adapter.set_dpi(n * 400).unwrap()).unwrap())
            .collect();

        assert!(matches!(failing.await, Err(Error::Hid(_))));
        let mut results = Vec::new();
        for reply in pending {
            results.push(reply.await);
        }
        let served = results.iter().filter(|r| matches!(r, Ok(r) if r.is_ok())).count();
        let dropped = results
            .iter()
            .filter(|r| matches!(r, Err(Error::Dropped { .. })))
            .count();
        assert_eq!((served, dropped), (2, 3));
        // The survivors are the oldest ones.
        assert!(results[0].is_ok() && results[1].is_ok());
        mgr.disconnect(&id).await.unwrap();
    }

    #[tokio::test]
    async fn exhausted_reconnect_disconnects_and_allows_a_fresh_connect() {
        let fake = FakeDevice::new();
        let mgr = manager_with(
            &fake,
            ConnectionConfig {
                backoff_base_ms: 20,
                max_reconnect_attempts: 2,
                ..fast_config().connection
            },
        );
        let mut events = mgr.subscribe();
        let dev = deathadder();
        let id = mgr.connect(&dev).await.unwrap();
        let adapter = mgr.adapter(&id).unwrap();

        // Enough failures to outlast the command and both reconnect attempts.
        fake.fail_next_writes(1_000);
        let failing = mgr.submit(&id, adapter.set_dpi(400).unwrap()).unwrap();
        let stranded = mgr.submit(&id, adapter.set_dpi(800).unwrap()).unwrap();

        assert!(matches!(failing.await, Err(Error::Hid(_))));
        let err = stranded.await.unwrap_err();
        assert!(matches!(err, Error::ConnectionFailed { .. }), "got {err}");
        assert_eq!(mgr.state(&id), ConnectionState::Disconnected);
        assert_eq!(fake.live_transports(), 0);
        assert_eq!(
            states(&mut events, 5).await,
            vec![
                ConnectionState::Probing,
                ConnectionState::Connected,
                ConnectionState::Degraded,
                ConnectionState::Reconnecting,
                ConnectionState::Disconnected,
            ]
        );

        fake.fail_next_writes(0);
        let id = mgr.connect(&dev).await.unwrap();
        assert_eq!(mgr.state(&id), ConnectionState::Connected);
        assert!(mgr.execute(&id, adapter.set_dpi(1600).unwrap()).await.unwrap().is_ok());
        mgr.disconnect(&id).await.unwrap();
    }

    #[tokio::test]
    async fn force_reconnect_keeps_serving_commands() {
        let fake = FakeDevice::new();
        let mgr = manager(&fake);
        let mut events = mgr.subscribe();
        let id = mgr.connect(&deathadder()).await.unwrap();

        mgr.force_reconnect(&id).unwrap();
        let cmd = mgr.adapter(&id).unwrap().set_dpi(3200).unwrap();
        assert!(mgr.execute(&id, cmd).await.unwrap().is_ok());
        assert_eq!(
            states(&mut events, 4).await,
            vec![
                ConnectionState::Probing,
                ConnectionState::Connected,
                ConnectionState::Reconnecting,
                ConnectionState::Connected,
            ]
        );
        assert_eq!(fake.live_transports(), 1);
        mgr.disconnect(&id).await.unwrap();
    }

    #[tokio::test]
    async fn unadvertised_capability_never_reaches_the_device() {
        let fake = FakeDevice::new();
        // Vendor-wide Razer fallback: DPI and polling rate only.
        let (mgr, id) = connected(&fake, &device(vids::RAZER, 0x0001)).await;
        let adapter = mgr.adapter(&id).unwrap();
        let before = fake.written().len();

        assert!(matches!(
            adapter.set_button_mapping(1, ButtonAction::Back),
            Err(Error::UnsupportedCapability { capability: Capability::ButtonMapping, .. })
        ));
        assert_eq!(fake.written().len(), before);
        mgr.disconnect(&id).await.unwrap();
    }

    #[tokio::test]
    async fn apply_profile_over_hidpp() {
        let fake = FakeDevice::new();
        let (mgr, id) = connected(&fake, &device(vids::LOGITECH, pids::G502_HERO)).await;

        let mut profile = DeviceProfile {
            name: "fps".into(),
            dpi: Some(1600),
            polling_rate: Some(PollingRate::Hz500),
            ..DeviceProfile::default()
        };
        profile.buttons.insert(3, ButtonAction::Back);

        let results = apply_profile(&mgr, &id, &profile).await.unwrap();
        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|r| r.is_ok()));
        mgr.disconnect(&id).await.unwrap();
    }

    #[tokio::test]
    async fn device_target_runs_macro_actions() {
        let fake = FakeDevice::new();
        let (mgr, id) = connected(&fake, &deathadder()).await;
        let before = fake.written().len();

        let m = MacroBuilder::new("dpi-shift")
            .device(DeviceAction::SetDpi { dpi: 400 })
            .press(MouseButton::Left)
            .move_by(10, 0)
            .wait(20)
            .device(DeviceAction::SetDpi { dpi: 1600 })
            .build();
        let player = MacroPlayer::new(Arc::new(m), PlayerConfig::default());
        let target = PlaybackTarget::Device {
            manager: mgr.clone(),
            device: id.clone(),
        };

        let summary = player.play(1, &target).await.unwrap();
        assert_eq!(summary.events_emitted, 2);
        // Button events never reach a device target, so nothing was held.
        assert!(summary.released_buttons.is_empty());
        assert_eq!(fake.written().len() - before, 2);
        mgr.disconnect(&id).await.unwrap();
    }
}
