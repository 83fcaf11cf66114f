//! Multi-node scenarios driven through the public host API only.

use std::collections::{HashSet, VecDeque};

use meshchat_core::{wire, Action, Config, Delivery, Identity, MeshCore, MessageType, PeerId};

/// In-memory mesh: nodes, undirected links, and everything each node delivered.
struct Mesh {
    nodes: Vec<MeshCore>,
    links: HashSet<(usize, usize)>,
    inbox: Vec<Vec<Delivery>>,
    /// Every frame put on a link, for inspection.
    wire_log: Vec<(usize, usize, Vec<u8>)>,
}

impl Mesh {
    fn new(names: &[&str], config: Config) -> Self {
        Self {
            nodes: names
                .iter()
                .map(|n| MeshCore::new(Identity::generate(), n, config.clone()))
                .collect(),
            links: HashSet::new(),
            inbox: vec![Vec::new(); names.len()],
            wire_log: Vec::new(),
        }
    }

    fn id(&self, i: usize) -> PeerId {
        self.nodes[i].peer_id()
    }

    fn index_of(&self, peer: PeerId) -> Option<usize> {
        self.nodes.iter().position(|n| n.peer_id() == peer)
    }

    fn linked(&self, a: usize, b: usize) -> bool {
        self.links.contains(&(a.min(b), a.max(b)))
    }

    fn neighbours(&self, a: usize) -> Vec<usize> {
        (0..self.nodes.len())
            .filter(|&b| b != a && self.linked(a, b))
            .collect()
    }

    fn link(&mut self, a: usize, b: usize) {
        self.links.insert((a.min(b), a.max(b)));
        let up_a = self.nodes[a].on_link_established(self.id(b));
        let up_b = self.nodes[b].on_link_established(self.id(a));
        self.run(vec![(a, up_a), (b, up_b)]);
    }

    fn unlink(&mut self, a: usize, b: usize) {
        self.links.remove(&(a.min(b), a.max(b)));
        let down_a = self.nodes[a].on_link_lost(self.id(b));
        let down_b = self.nodes[b].on_link_lost(self.id(a));
        self.run(vec![(a, down_a), (b, down_b)]);
    }

    fn deliver(&mut self, from: usize, to: usize, bytes: Vec<u8>, queue: &mut VecDeque<(usize, Action)>) {
        let out = self.nodes[to]
            .on_packet_received(self.id(from), &bytes)
            .expect("frames on the mesh decode");
        self.wire_log.push((from, to, bytes));
        queue.extend(out.into_iter().map(|a| (to, a)));
    }

    fn run(&mut self, initial: Vec<(usize, Vec<Action>)>) {
        let mut queue: VecDeque<(usize, Action)> = initial
            .into_iter()
            .flat_map(|(i, actions)| actions.into_iter().map(move |a| (i, a)))
            .collect();
        let mut steps = 0;
        while let Some((origin, action)) = queue.pop_front() {
            steps += 1;
            assert!(steps < 20_000, "mesh did not settle");
            match action {
                Action::Deliver(d) => self.inbox[origin].push(d),
                Action::Send { to, bytes } => {
                    let target = self.index_of(to).filter(|&t| self.linked(origin, t));
                    if let Some(t) = target {
                        self.deliver(origin, t, bytes, &mut queue);
                    }
                }
                Action::Broadcast { bytes, exclude } => {
                    for t in self.neighbours(origin) {
                        if exclude != Some(self.id(t)) {
                            self.deliver(origin, t, bytes.clone(), &mut queue);
                        }
                    }
                }
            }
        }
    }

    fn tick_all(&mut self) {
        let ticks = (0..self.nodes.len())
            .map(|i| (i, self.nodes[i].tick()))
            .collect();
        self.run(ticks);
    }

    fn public_texts(&self, i: usize) -> Vec<String> {
        self.inbox[i]
            .iter()
            .filter_map(|d| match d {
                Delivery::PublicMessage { text, .. } => Some(text.clone()),
                _ => None,
            })
            .collect()
    }

    fn private_texts(&self, i: usize) -> Vec<String> {
        self.inbox[i]
            .iter()
            .filter_map(|d| match d {
                Delivery::PrivateMessage { text, .. } => Some(text.clone()),
                _ => None,
            })
            .collect()
    }
}

fn quiet() -> Config {
    Config {
        announce_interval_ticks: 0,
        ..Config::default()
    }
}

/// alice - bob - carol
fn line(config: Config) -> Mesh {
    let mut mesh = Mesh::new(&["alice", "bob", "carol"], config);
    mesh.link(0, 1);
    mesh.link(1, 2);
    mesh
}

#[test]
fn public_message_floods_exactly_once() {
    let mut mesh = line(quiet());
    let out = mesh.nodes[0].send_public_message("hello everyone").unwrap();
    mesh.run(vec![(0, out)]);

    assert_eq!(mesh.public_texts(1), vec!["hello everyone"]);
    assert_eq!(mesh.public_texts(2), vec!["hello everyone"]);
    assert!(mesh.public_texts(0).is_empty());
}

#[test]
fn announces_propagate_across_hops() {
    let mesh = line(quiet());
    let carol = mesh.id(2);
    let record = mesh.nodes[0].peers().get(carol).expect("alice learns of carol");
    assert_eq!(record.nickname, "carol");

    let snapshot = mesh.nodes[0].topology_snapshot();
    assert_eq!(snapshot.nodes.len(), 3);
    assert_eq!(snapshot.edges.iter().filter(|e| e.is_confirmed).count(), 2);
}

#[test]
fn private_message_across_relay() {
    let mut mesh = line(quiet());
    let carol = mesh.id(2);
    let (message_id, out) = mesh.nodes[0]
        .send_private_message(carol, "for carol only")
        .unwrap();
    mesh.run(vec![(0, out)]);

    assert_eq!(mesh.private_texts(2), vec!["for carol only"]);
    assert!(mesh.private_texts(1).is_empty());
    assert!(mesh.inbox[0].contains(&Delivery::DeliveryAck {
        from: carol,
        message_id
    }));

    // Bob relayed ciphertext only.
    let plaintext = b"for carol only";
    assert!(mesh
        .wire_log
        .iter()
        .all(|(_, _, bytes)| !bytes.windows(plaintext.len()).any(|w| w == plaintext)));
}

#[test]
fn v2_private_message_follows_source_route() {
    let config = Config {
        protocol_version: 2,
        ..quiet()
    };
    // alice - bob - carol, plus dave hanging off bob.
    let mut mesh = Mesh::new(&["alice", "bob", "carol", "dave"], config);
    mesh.link(0, 1);
    mesh.link(1, 2);
    mesh.link(1, 3);
    assert_eq!(
        mesh.nodes[0].topology().compute_route(mesh.id(0), mesh.id(2), 7),
        Some(vec![mesh.id(1)])
    );

    mesh.wire_log.clear();
    let carol = mesh.id(2);
    let (_, out) = mesh.nodes[0].send_private_message(carol, "routed").unwrap();
    mesh.run(vec![(0, out)]);

    assert_eq!(mesh.private_texts(2), vec!["routed"]);
    // Nothing addressed to carol was flooded to dave.
    for (_, to, bytes) in &mesh.wire_log {
        if *to == 3 {
            let packet = wire::decode(bytes).unwrap();
            assert_ne!(packet.recipient_id, Some(carol));
        }
    }
    let routed = mesh
        .wire_log
        .iter()
        .map(|(_, _, b)| wire::decode(b).unwrap())
        .find(|p| p.message_type == MessageType::NoiseHandshake && p.sender_id == mesh.id(0))
        .expect("handshake was sent");
    assert_eq!(routed.route, Some(vec![mesh.id(1)]));
}

#[test]
fn late_joiner_catches_up_through_sync() {
    let mut mesh = Mesh::new(&["alice", "bob", "carol"], quiet());
    mesh.link(0, 1);
    let out = mesh.nodes[0].send_public_message("before you arrived").unwrap();
    mesh.run(vec![(0, out)]);
    assert!(mesh.public_texts(2).is_empty());

    mesh.link(1, 2);
    assert_eq!(mesh.public_texts(2), vec!["before you arrived"]);
    assert!(mesh.nodes[2].peers().get(mesh.id(0)).is_some());
}

#[test]
fn large_private_message_is_fragmented_and_reassembled() {
    let mut mesh = line(quiet());
    let carol = mesh.id(2);
    let text: String = (0..3000u32)
        .map(|i| char::from(b'a' + ((i * 7919 + i / 13) % 26) as u8))
        .collect();

    // Establish the session first so the message itself is the only large payload.
    let (_, out) = mesh.nodes[0].send_private_message(carol, "hi").unwrap();
    mesh.run(vec![(0, out)]);
    mesh.wire_log.clear();

    let (_, out) = mesh.nodes[0].send_private_message(carol, &text).unwrap();
    mesh.run(vec![(0, out)]);

    assert_eq!(mesh.private_texts(2), vec!["hi".to_string(), text]);
    assert!(mesh
        .wire_log
        .iter()
        .any(|(_, _, b)| wire::decode(b).unwrap().message_type == MessageType::Fragment));
}

#[test]
fn dropping_a_link_is_announced() {
    let mut mesh = line(quiet());
    mesh.unlink(1, 2);
    let bob = mesh.id(1);
    assert_eq!(mesh.nodes[0].topology().neighbors_of(bob), Some(vec![mesh.id(0)]));
    assert_eq!(
        mesh.nodes[0]
            .topology()
            .compute_route(mesh.id(0), mesh.id(2), 7),
        None
    );
}

#[test]
fn periodic_announce_refreshes_peers() {
    let config = Config {
        announce_interval_ticks: 1,
        ..Config::default()
    };
    let mut mesh = Mesh::new(&["alice", "bob"], config);
    mesh.link(0, 1);
    mesh.nodes[1].set_nickname("robert");
    mesh.tick_all();
    let bob = mesh.id(1);
    assert_eq!(mesh.nodes[0].peers().get(bob).unwrap().nickname, "robert");
    assert!(mesh.inbox[0].contains(&Delivery::PeerAnnounced {
        peer: bob,
        nickname: "robert".into()
    }));
}
