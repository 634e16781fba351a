use integration_tests::prelude::*;
use serial_test::serial;

const PRODUCER_ID: u8 = 1;
const CONSUMER_ID: u8 = 2;

struct ProducerObjects {
    common: CommonObjects,
    speed: ScalarField<u16>,
    mode: ScalarField<u8>,
    count: ScalarField<u32>,
}

impl ProducerObjects {
    fn new() -> Self {
        Self {
            common: CommonObjects::new(),
            speed: ScalarField::<u16>::new(0),
            mode: ScalarField::<u8>::new(0),
            count: ScalarField::<u32>::new(0),
        }
    }

    fn entries(&self) -> [ObjectEntry<'_>; 3] {
        [
            ObjectEntry::new(0x2000, AccessType::Rw, SlotRef::U16(&self.speed)),
            ObjectEntry::new(0x2001, AccessType::Rw, SlotRef::U8(&self.mode)),
            ObjectEntry::new(0x2002, AccessType::Rw, SlotRef::U32(&self.count)),
        ]
    }
}

struct ConsumerObjects {
    common: CommonObjects,
    speed: ScalarField<u16>,
    mode: ScalarField<u8>,
    count: ScalarField<u32>,
}

impl ConsumerObjects {
    fn new() -> Self {
        Self {
            common: CommonObjects::new(),
            speed: ScalarField::<u16>::new(0),
            mode: ScalarField::<u8>::new(0),
            count: ScalarField::<u32>::new(0),
        }
    }

    fn entries(&self) -> [ObjectEntry<'_>; 3] {
        [
            ObjectEntry::new(0x2100, AccessType::Rw, SlotRef::U16(&self.speed)),
            ObjectEntry::new(0x2101, AccessType::Rw, SlotRef::U8(&self.mode)),
            ObjectEntry::new(0x2102, AccessType::Rw, SlotRef::U32(&self.count)),
        ]
    }
}

fn mapping(index: u16, bits: u8) -> PdoMappingConfig {
    PdoMappingConfig {
        index,
        sub: 0,
        bits,
    }
}

fn producer_config() -> NodeConfig {
    let mut config = NodeConfig::new(PRODUCER_ID);

    let mut periodic = PdoConfig::new(0);
    periodic.event_timer_ms = 5;
    periodic.mappings.push(mapping(0x2000, 16)).unwrap();
    periodic.mappings.push(mapping(0x2001, 8)).unwrap();
    config.tpdos.push(periodic).unwrap();

    // Sent only on request
    let mut on_change = PdoConfig::new(1);
    on_change.mappings.push(mapping(0x2002, 32)).unwrap();
    config.tpdos.push(on_change).unwrap();
    config
}

fn consumer_config() -> NodeConfig {
    let mut config = NodeConfig::new(CONSUMER_ID);

    let mut rpdo0 = PdoConfig::new(0);
    rpdo0.cob_id = Some(0x180 + PRODUCER_ID as u16);
    rpdo0.mappings.push(mapping(0x2100, 16)).unwrap();
    rpdo0.mappings.push(mapping(0x2101, 8)).unwrap();
    config.rpdos.push(rpdo0).unwrap();

    let mut rpdo1 = PdoConfig::new(1);
    rpdo1.cob_id = Some(0x280 + PRODUCER_ID as u16);
    rpdo1.mappings.push(mapping(0x2102, 32)).unwrap();
    config.rpdos.push(rpdo1).unwrap();
    config
}

fn start_all(master: &mut SimBusSender) {
    master
        .send(
            NmtCommand {
                cmd: NmtCommandSpecifier::Start,
                node: 0,
            }
            .into(),
        )
        .unwrap();
}

#[test]
#[serial]
fn test_tpdo_to_rpdo() {
    init_logging();
    let producer_config = producer_config();
    let consumer_config = consumer_config();
    let producer = ProducerObjects::new();
    let consumer = ConsumerObjects::new();
    let producer_entries = producer.entries();
    let consumer_entries = consumer.entries();
    let mut writes = Vec::new();
    let mut on_write = |index: u16, sub: u8| writes.push((index, sub));

    {
        let producer_node = shared_node(&producer_config, &producer.common, &producer_entries);
        let callbacks = Callbacks {
            on_write: Some(&mut on_write),
            ..Default::default()
        };
        let consumer_node = SharedNode::new(
            CanOpenNode::init(
                &consumer_config,
                &consumer.common,
                &consumer_entries,
                callbacks,
            )
            .unwrap(),
        );

        let mut bus = SimBus::new();
        let _logger = BusLogger::new(bus.new_receiver());
        let mut master = bus.new_sender();
        let mut nodes = [
            (&producer_node, bus.new_port()),
            (&consumer_node, bus.new_port()),
        ];
        step_all(&mut nodes, 0);

        producer.speed.store(1500);
        producer.mode.store(3);

        // No PDOs outside of Operational
        for _ in 0..10 {
            step_all(&mut nodes, 1);
        }
        assert_eq!(0, consumer.speed.load());

        start_all(&mut master);
        for _ in 0..10 {
            step_all(&mut nodes, 1);
        }
        assert_eq!(1500, consumer.speed.load());
        assert_eq!(3, consumer.mode.load());
        assert_eq!(0, consumer.count.load());

        // The event-driven TPDO goes out once after an update
        producer.count.store(0xdeadbeef);
        assert!(producer_node.with(|n| n.pdo_mapping_update(0x2002, 0)));
        assert!(!producer_node.with(|n| n.pdo_mapping_update(0x2003, 0)));
        step_all(&mut nodes, 1);
        step_all(&mut nodes, 1);
        assert_eq!(0xdeadbeef, consumer.count.load());
    }

    assert!(writes.contains(&(0x2100, 0)));
    assert!(writes.contains(&(0x2101, 0)));
    assert_eq!(1, writes.iter().filter(|w| **w == (0x2102, 0)).count());
}

#[test]
#[serial]
fn test_pdos_stop_outside_operational() {
    init_logging();
    let producer_config = producer_config();
    let producer = ProducerObjects::new();
    let producer_entries = producer.entries();
    let producer_node = shared_node(&producer_config, &producer.common, &producer_entries);

    let mut bus = SimBus::new();
    let mut rx = bus.new_receiver();
    let mut master = bus.new_sender();
    let mut nodes = [(&producer_node, bus.new_port())];
    step_all(&mut nodes, 0);

    start_all(&mut master);
    for _ in 0..30 {
        step_all(&mut nodes, 1);
    }
    let tpdo_id = CanId::std(0x180 + PRODUCER_ID as u16);
    let sent = rx.drain().iter().filter(|m| m.id() == tpdo_id).count();
    assert!(sent >= 3, "Expected periodic TPDOs, got {sent}");

    master
        .send(
            NmtCommand {
                cmd: NmtCommandSpecifier::EnterPreOperational,
                node: PRODUCER_ID,
            }
            .into(),
        )
        .unwrap();
    step_all(&mut nodes, 1);
    rx.flush();
    for _ in 0..20 {
        step_all(&mut nodes, 1);
    }
    assert_eq!(0, rx.drain().iter().filter(|m| m.id() == tpdo_id).count());
}

#[tokio::test]
#[serial]
async fn test_pdo_config_over_sdo() {
    init_logging();
    const CLIENT_ID: u8 = 5;
    let producer_config = NodeConfig::new(PRODUCER_ID);
    let client_config = NodeConfig::new(CLIENT_ID);
    let producer = ProducerObjects::new();
    let client_common = CommonObjects::new();
    let producer_entries = producer.entries();
    let producer_node = shared_node(&producer_config, &producer.common, &producer_entries);
    let client = shared_node(&client_config, &client_common, &[]);

    let mut bus = SimBus::new();
    let mut rx = bus.new_receiver();
    let mut master = bus.new_sender();
    let mut nodes = [(&producer_node, bus.new_port()), (&client, bus.new_port())];

    test_with_background_process(&mut nodes, async {
        // Map 0x2000 into TPDO 2 with a 2 ms event timer
        client
            .write_sync(PRODUCER_ID, 0x1A02, 1, &0x2000_0010u32.to_le_bytes(), 200)
            .await
            .unwrap();
        client
            .write_sync(PRODUCER_ID, 0x1802, 5, &2u32.to_le_bytes(), 200)
            .await
            .unwrap();
        producer.speed.store(0x1234);
        start_all(&mut master);
        tokio::time::sleep(tokio::time::Duration::from_millis(20)).await;
    })
    .await;

    let tpdo_id = CanId::std(0x380 + PRODUCER_ID as u16);
    let frames: Vec<_> = rx.drain().into_iter().filter(|m| m.id() == tpdo_id).collect();
    assert!(!frames.is_empty());
    assert_eq!(&[0x34, 0x12], frames[0].data());
}
