use std::time::Duration;

use assertables::assert_contains;
use integration_tests::prelude::*;
use serial_test::serial;

const CLIENT_ID: u8 = 1;
const SERVER_ID: u8 = 2;
const TIMEOUT_MS: u32 = 200;

struct ServerObjects {
    common: CommonObjects,
    value: ScalarField<u32>,
    name: StringField<889>,
    readonly: ScalarField<u16>,
}

impl ServerObjects {
    fn new() -> Self {
        Self {
            common: CommonObjects::new(),
            value: ScalarField::<u32>::new(0),
            name: StringField::new(b""),
            readonly: ScalarField::<u16>::new(0x55),
        }
    }

    fn entries(&self) -> [ObjectEntry<'_>; 3] {
        [
            ObjectEntry::new(0x2000, AccessType::Rw, SlotRef::U32(&self.value)),
            ObjectEntry::new(0x2001, AccessType::Rw, SlotRef::Str(&self.name)),
            ObjectEntry::new(0x2002, AccessType::Ro, SlotRef::U16(&self.readonly)),
        ]
    }

    fn name(&self) -> Vec<u8> {
        let (buf, len) = self.name.load();
        buf[..len].to_vec()
    }
}

#[tokio::test]
#[serial]
async fn test_expedited_transfer() {
    init_logging();
    let client_config = NodeConfig::new(CLIENT_ID);
    let server_config = NodeConfig::new(SERVER_ID);
    let client_common = CommonObjects::new();
    let server = ServerObjects::new();
    let server_entries = server.entries();
    let client = shared_node(&client_config, &client_common, &[]);
    let server_node = shared_node(&server_config, &server.common, &server_entries);

    let mut bus = SimBus::new();
    let _logger = BusLogger::new(bus.new_receiver());
    let mut nodes = [(&client, bus.new_port()), (&server_node, bus.new_port())];

    test_with_background_process(&mut nodes, async {
        client
            .write_sync(SERVER_ID, 0x2000, 0, &0x12345678u32.to_le_bytes(), TIMEOUT_MS)
            .await
            .unwrap();
        assert_eq!(0x12345678, server.value.load());

        let mut buf = [0u8; 4];
        let len = client
            .read_sync(SERVER_ID, 0x2000, 0, &mut buf, TIMEOUT_MS)
            .await
            .unwrap();
        assert_eq!(4, len);
        assert_eq!(0x12345678u32.to_le_bytes(), buf);

        // The node ID object holds the configured ID
        let len = client
            .read_sync(SERVER_ID, 0x100B, 0, &mut buf, TIMEOUT_MS)
            .await
            .unwrap();
        assert_eq!(&[SERVER_ID], &buf[..len]);
    })
    .await;
}

#[tokio::test]
#[serial]
async fn test_segmented_transfer() {
    init_logging();
    let client_config = NodeConfig::new(CLIENT_ID);
    let server_config = NodeConfig::new(SERVER_ID);
    let client_common = CommonObjects::new();
    let server = ServerObjects::new();
    let server_entries = server.entries();
    let client = shared_node(&client_config, &client_common, &[]);
    let server_node = shared_node(&server_config, &server.common, &server_entries);

    let mut bus = SimBus::new();
    let _logger = BusLogger::new(bus.new_receiver());
    let mut nodes = [(&client, bus.new_port()), (&server_node, bus.new_port())];

    test_with_background_process(&mut nodes, async {
        let data = b"a string longer than one segment";
        client
            .write_sync(SERVER_ID, 0x2001, 0, data, TIMEOUT_MS)
            .await
            .unwrap();
        assert_eq!(data.to_vec(), server.name());

        let mut buf = [0u8; 64];
        let len = client
            .read_sync(SERVER_ID, 0x2001, 0, &mut buf, TIMEOUT_MS)
            .await
            .unwrap();
        assert_eq!(&data[..], &buf[..len]);

        // Short strings are still uploaded in segments
        client
            .write_sync(SERVER_ID, 0x2001, 0, b"abcdefgh", TIMEOUT_MS)
            .await
            .unwrap();
        let len = client
            .read_sync(SERVER_ID, 0x2001, 0, &mut buf, TIMEOUT_MS)
            .await
            .unwrap();
        assert_eq!(b"abcdefgh", &buf[..len]);

        // A buffer too small for the value
        let mut small = [0u8; 4];
        assert_eq!(
            Err(SdoClientError::BufferTooSmall),
            client
                .read_sync(SERVER_ID, 0x2001, 0, &mut small, TIMEOUT_MS)
                .await
        );
    })
    .await;
}

#[tokio::test]
#[serial]
async fn test_block_transfer() {
    init_logging();
    let client_config = NodeConfig::new(CLIENT_ID);
    let server_config = NodeConfig::new(SERVER_ID);
    let client_common = CommonObjects::new();
    let server = ServerObjects::new();
    let server_entries = server.entries();
    let client = shared_node(&client_config, &client_common, &[]);
    let server_node = shared_node(&server_config, &server.common, &server_entries);

    let mut bus = SimBus::new();
    let _logger = BusLogger::new(bus.new_receiver());
    let mut nodes = [(&client, bus.new_port()), (&server_node, bus.new_port())];

    test_with_background_process(&mut nodes, async {
        let data: Vec<u8> = (0..100).collect();
        client
            .block_write_sync(SERVER_ID, 0x2001, 0, &data, TIMEOUT_MS)
            .await
            .unwrap();
        assert_eq!(data, server.name());

        // Close to the transfer size limit
        let data: Vec<u8> = (0..800).map(|i| (i % 251) as u8).collect();
        client
            .block_write_sync(SERVER_ID, 0x2001, 0, &data, TIMEOUT_MS)
            .await
            .unwrap();
        assert_eq!(data, server.name());

        let mut buf = [0u8; 889];
        let len = client
            .block_read_sync(SERVER_ID, 0x2001, 0, &mut buf, TIMEOUT_MS)
            .await
            .unwrap();
        assert_eq!(&data[..], &buf[..len]);
    })
    .await;
}

#[tokio::test]
#[serial]
async fn test_server_aborts() {
    init_logging();
    let client_config = NodeConfig::new(CLIENT_ID);
    let server_config = NodeConfig::new(SERVER_ID);
    let client_common = CommonObjects::new();
    let server = ServerObjects::new();
    let server_entries = server.entries();
    let client = shared_node(&client_config, &client_common, &[]);
    let server_node = shared_node(&server_config, &server.common, &server_entries);

    let mut bus = SimBus::new();
    let _logger = BusLogger::new(bus.new_receiver());
    let mut nodes = [(&client, bus.new_port()), (&server_node, bus.new_port())];

    test_with_background_process(&mut nodes, async {
        let mut buf = [0u8; 4];
        assert_eq!(
            Err(SdoClientError::Aborted {
                index: 0x3000,
                sub: 0,
                abort_code: AbortCode::NoSuchObject.into()
            }),
            client
                .read_sync(SERVER_ID, 0x3000, 0, &mut buf, TIMEOUT_MS)
                .await
        );

        assert_eq!(
            Err(SdoClientError::Aborted {
                index: 0x2002,
                sub: 0,
                abort_code: AbortCode::ReadOnly.into()
            }),
            client
                .write_sync(SERVER_ID, 0x2002, 0, &[1, 0], TIMEOUT_MS)
                .await
        );
        assert_eq!(0x55, server.readonly.load());

        // Wrong size for a u32
        assert!(client
            .write_sync(SERVER_ID, 0x2000, 0, &[1, 2], TIMEOUT_MS)
            .await
            .is_err());
        assert_eq!(0, server.value.load());
    })
    .await;
}

#[tokio::test]
#[serial]
async fn test_client_errors() {
    init_logging();
    let client_config = NodeConfig::new(CLIENT_ID);
    let client_common = CommonObjects::new();
    let client = shared_node(&client_config, &client_common, &[]);

    let mut bus = SimBus::new();
    let _logger = BusLogger::new(bus.new_receiver());
    let mut nodes = [(&client, bus.new_port())];

    test_with_background_process(&mut nodes, async {
        let mut buf = [0u8; 4];
        assert_eq!(
            Err(SdoClientError::NotResponding { node_id: 50 }),
            client.read_sync(50, 0x2000, 0, &mut buf, 20).await
        );

        assert_eq!(
            Err(SdoClientError::InvalidNodeId { node_id: 0 }),
            client.read_sync(0, 0x2000, 0, &mut buf, 20).await
        );

        let data = vec![0u8; 1000];
        assert_eq!(
            Err(SdoClientError::TransferTooLarge { len: 1000 }),
            client.write_sync(50, 0x2000, 0, &data, 20).await
        );
    })
    .await;
}

#[tokio::test]
#[serial]
async fn test_fire_and_forget_write() {
    init_logging();
    let client_config = NodeConfig::new(CLIENT_ID);
    let server_config = NodeConfig::new(SERVER_ID);
    let client_common = CommonObjects::new();
    let server = ServerObjects::new();
    let server_entries = server.entries();
    let client = shared_node(&client_config, &client_common, &[]);
    let server_node = shared_node(&server_config, &server.common, &server_entries);

    let mut bus = SimBus::new();
    let _logger = BusLogger::new(bus.new_receiver());
    let mut nodes = [(&client, bus.new_port()), (&server_node, bus.new_port())];

    test_with_background_process(&mut nodes, async {
        client
            .with(|node| node.sdo_write(SERVER_ID, 0x2000, 0, &7u32.to_le_bytes()))
            .unwrap();

        // The slot is taken until the server answers
        assert_eq!(
            Err(SdoClientError::HardwareBusy),
            client
                .write_sync(SERVER_ID, 0x2000, 0, &8u32.to_le_bytes(), TIMEOUT_MS)
                .await
        );
        assert_eq!(
            Err(SdoClientError::HardwareBusy),
            client.with(|node| node.sdo_write(SERVER_ID, 0x2000, 0, &[0; 4]))
        );

        while server.value.load() != 7 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        let result = loop {
            match client
                .write_sync(SERVER_ID, 0x2000, 0, &8u32.to_le_bytes(), TIMEOUT_MS)
                .await
            {
                Err(SdoClientError::HardwareBusy) => {
                    tokio::time::sleep(Duration::from_millis(1)).await
                }
                result => break result,
            }
        };
        assert_eq!(Ok(()), result);
        assert_eq!(8, server.value.load());
    })
    .await;
}

#[tokio::test]
#[serial]
async fn test_dropped_request_releases_client() {
    init_logging();
    let client_config = NodeConfig::new(CLIENT_ID);
    let server_config = NodeConfig::new(SERVER_ID);
    let client_common = CommonObjects::new();
    let server = ServerObjects::new();
    let server_entries = server.entries();
    let client = shared_node(&client_config, &client_common, &[]);
    let server_node = shared_node(&server_config, &server.common, &server_entries);

    let mut bus = SimBus::new();
    let mut rx = bus.new_receiver();
    let mut nodes = [(&client, bus.new_port()), (&server_node, bus.new_port())];

    test_with_background_process(&mut nodes, async {
        let mut buf = [0u8; 4];
        let result = tokio::time::timeout(
            Duration::from_millis(10),
            client.read_sync(50, 0x2000, 0, &mut buf, 1000),
        )
        .await;
        assert!(result.is_err());

        // The client is free again at once
        client
            .write_sync(SERVER_ID, 0x2000, 0, &3u32.to_le_bytes(), TIMEOUT_MS)
            .await
            .unwrap();
        assert_eq!(3, server.value.load());
    })
    .await;

    // The abandoned transfer was aborted towards its server
    let frames = rx.drain();
    let abort = CanMessage::new(
        CanId::std(0x600 + 50),
        &[
            0x80,
            0x00,
            0x20,
            0x00,
            0x00,
            0x00,
            0x00,
            0x08,
        ],
    );
    assert_contains!(frames, &abort);
}

#[tokio::test]
#[serial]
async fn test_concurrent_clients() {
    init_logging();
    let mut config_a = NodeConfig::new(CLIENT_ID);
    config_a.device_type = 0xA;
    let mut config_b = NodeConfig::new(SERVER_ID);
    config_b.device_type = 0xB;
    let common_a = CommonObjects::new();
    let common_b = CommonObjects::new();
    let node_a = shared_node(&config_a, &common_a, &[]);
    let node_b = shared_node(&config_b, &common_b, &[]);

    let mut bus = SimBus::new();
    let _logger = BusLogger::new(bus.new_receiver());
    let mut nodes = [(&node_a, bus.new_port()), (&node_b, bus.new_port())];

    test_with_background_process(&mut nodes, async {
        let mut buf_a = [0u8; 4];
        let mut buf_b = [0u8; 4];
        let (from_b, from_a) = futures::join!(
            node_a.read_sync(SERVER_ID, 0x1000, 0, &mut buf_a, TIMEOUT_MS),
            node_b.read_sync(CLIENT_ID, 0x1000, 0, &mut buf_b, TIMEOUT_MS),
        );
        assert_eq!(Ok(4), from_b);
        assert_eq!(Ok(4), from_a);
        assert_eq!(0xB, u32::from_le_bytes(buf_a));
        assert_eq!(0xA, u32::from_le_bytes(buf_b));
    })
    .await;
}
