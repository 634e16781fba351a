use integration_tests::prelude::*;
use serial_test::serial;

#[test]
#[serial]
fn test_emcy_between_nodes() {
    init_logging();
    let config_a = NodeConfig::new(1);
    let config_b = NodeConfig::new(2);
    let common_a = CommonObjects::new();
    let common_b = CommonObjects::new();
    let node_a = shared_node(&config_a, &common_a, &[]);
    let node_b = shared_node(&config_b, &common_b, &[]);

    let mut bus = SimBus::new();
    let mut rx = bus.new_receiver();
    let mut nodes = [(&node_a, bus.new_port()), (&node_b, bus.new_port())];
    step_all(&mut nodes, 0);
    rx.flush();

    node_a.with(|n| n.emcy_send(0x3210, [1, 2, 3, 4]));
    step_all(&mut nodes, 1);

    let expected = Emergency {
        node: 1,
        error_code: 0x3210,
        data: [1, 2, 3, 4],
    };
    let frames = rx.drain();
    assert_eq!(1, frames.len());
    assert_eq!(0x81, frames[0].id().raw());
    assert_eq!(&[0, 0, 0x10, 0x32, 1, 2, 3, 4], frames[0].data());

    assert_eq!(Some(expected), node_b.with(|n| n.emcy_pop()));
    assert_eq!(None, node_b.with(|n| n.emcy_pop()));
    // Not delivered back to the sender
    assert_eq!(None, node_a.with(|n| n.emcy_pop()));
}

#[test]
#[serial]
fn test_emcy_queue_overflow() {
    init_logging();
    let config = NodeConfig::new(1);
    let common = CommonObjects::new();
    let node = shared_node(&config, &common, &[]);

    let mut bus = SimBus::new();
    let mut master = bus.new_sender();
    let mut nodes = [(&node, bus.new_port())];
    step_all(&mut nodes, 0);

    for i in 0..20u16 {
        let emcy = Emergency {
            node: 5,
            error_code: 0x1000 + i,
            data: [0; 4],
        };
        master.send(emcy.into()).unwrap();
    }
    // Also an emergency carrying this node's own ID
    master
        .send(
            Emergency {
                node: 1,
                error_code: 0xFF00,
                data: [0; 4],
            }
            .into(),
        )
        .unwrap();
    step_all(&mut nodes, 1);

    let codes: Vec<u16> = std::iter::from_fn(|| node.with(|n| n.emcy_pop()))
        .map(|emcy| emcy.error_code)
        .collect();
    // The four oldest were dropped
    assert_eq!((0x1004..0x1014).collect::<Vec<u16>>(), codes);
}
