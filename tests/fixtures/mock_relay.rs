//! In-process AMT relay for loopback tests.
//!
//! Listens on one or more 127.0.0.x addresses sharing a port, answers
//! discovery and request messages, records everything a gateway sends and
//! streams Multicast Data once the gateway joins.
//!
//! # Example
//!
//! ```no_run
//! use amt_integration_tests::fixtures::{Behavior, MockRelay, RelayOptions, RelaySpec};
//! use std::net::Ipv4Addr;
//!
//! # async fn example() -> std::io::Result<()> {
//! let relay = MockRelay::start(
//!     vec![RelaySpec::new(Ipv4Addr::new(127, 0, 0, 2), Behavior::Normal)],
//!     RelayOptions::default(),
//! )
//! .await?;
//! let config = relay.gateway_config();
//! # Ok(())
//! # }
//! ```

use amt_core::{
    IgmpQuery, MembershipQuery, MembershipUpdate, MessageType, MulticastData, RelayAdvertisement,
    RelayDiscovery, RelayRequest, ResponseMac,
};
use amt_gateway::GatewayConfig;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

/// How one relay address reacts to discovery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    /// Answer everything and stream data after the join
    Normal,
    /// Record but never answer
    Silent,
    /// Answer discovery with a corrupted nonce
    WrongNonce,
    /// Answer discovery correctly, then the request with a corrupted nonce
    WrongQueryNonce,
    /// Complete the handshake but never send data
    NoData,
}

/// One listening address of the relay
#[derive(Debug, Clone, Copy)]
pub struct RelaySpec {
    /// Address to listen on
    pub addr: Ipv4Addr,
    /// Reaction to gateway messages
    pub behavior: Behavior,
    /// Address to advertise (defaults to `addr`)
    pub advertise: Option<Ipv4Addr>,
}

impl RelaySpec {
    /// Listen on `addr` with `behavior`, advertising itself
    #[must_use]
    pub fn new(addr: Ipv4Addr, behavior: Behavior) -> Self {
        Self {
            addr,
            behavior,
            advertise: None,
        }
    }

    /// Advertise `relay` instead of the listening address
    #[must_use]
    pub fn advertising(mut self, relay: Ipv4Addr) -> Self {
        self.advertise = Some(relay);
        self
    }
}

/// Values shared by all relay addresses
#[derive(Debug, Clone)]
pub struct RelayOptions {
    /// MAC handed out in membership queries
    pub mac: ResponseMac,
    /// Raw QQIC of the membership query
    pub qqic: u8,
    /// Number of data packets streamed after the join
    pub packets: usize,
    /// Payload size of each data packet
    pub payload_len: usize,
    /// Gap between data packets
    pub packet_gap: Duration,
    /// Send a new membership query after this many packets
    pub requery_after: Option<usize>,
    /// MAC used by the re-query
    pub requery_mac: ResponseMac,
    /// Cut this data packet off inside its IP header
    pub truncate_packet: Option<usize>,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            mac: ResponseMac([0x01, 0x02, 0x03, 0x04, 0x05, 0xAB]),
            qqic: 0,
            packets: 20,
            payload_len: 188,
            packet_gap: Duration::from_millis(10),
            requery_after: None,
            requery_mac: ResponseMac([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]),
            truncate_packet: None,
        }
    }
}

/// What the relay saw
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    /// Relay Discovery received on `at`
    Discovery {
        /// Local relay address
        at: SocketAddr,
        /// Discovery nonce
        nonce: u32,
    },
    /// Request received on `at`
    Request {
        /// Local relay address
        at: SocketAddr,
        /// Request nonce
        nonce: u32,
    },
    /// Membership Update received on `at`
    Update {
        /// Local relay address
        at: SocketAddr,
        /// Decoded update
        update: MembershipUpdate,
    },
    /// Anything else
    Other {
        /// Local relay address
        at: SocketAddr,
        /// First byte of the datagram
        type_byte: u8,
    },
}

/// Length a truncated data packet is cut to
pub const TRUNCATED_LEN: usize = 12;

/// Payload of the `index`th data packet
#[must_use]
pub fn payload_for(index: usize, len: usize) -> Vec<u8> {
    let mut payload = vec![(index & 0xFF) as u8; len];
    if let Some(first) = payload.first_mut() {
        *first = 0x47;
    }
    payload
}

struct Shared {
    options: RelayOptions,
    events: Mutex<Vec<RelayEvent>>,
    streaming: AtomicBool,
    left: AtomicBool,
    sent: AtomicUsize,
}

impl Shared {
    fn record(&self, event: RelayEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

/// Running mock relay
pub struct MockRelay {
    port: u16,
    addrs: Vec<Ipv4Addr>,
    shared: Arc<Shared>,
    tasks: Vec<JoinHandle<()>>,
}

impl MockRelay {
    /// Bind every relay address on one shared port and start answering
    ///
    /// # Errors
    /// Returns the bind error if no common port could be found
    pub async fn start(specs: Vec<RelaySpec>, options: RelayOptions) -> io::Result<Self> {
        let (port, sockets) = bind_shared_port(&specs).await?;

        let shared = Arc::new(Shared {
            options,
            events: Mutex::new(Vec::new()),
            streaming: AtomicBool::new(false),
            left: AtomicBool::new(false),
            sent: AtomicUsize::new(0),
        });

        let tasks = specs
            .iter()
            .zip(sockets)
            .map(|(spec, socket)| {
                tokio::spawn(serve(*spec, port, Arc::new(socket), Arc::clone(&shared)))
            })
            .collect();

        Ok(Self {
            port,
            addrs: specs.iter().map(|s| s.addr).collect(),
            shared,
            tasks,
        })
    }

    /// Port every relay address listens on
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Gateway configuration pointing at every relay address in order,
    /// with short timeouts and joins on loopback
    #[must_use]
    pub fn gateway_config(&self) -> GatewayConfig {
        GatewayConfig {
            native_timeout: Duration::from_millis(200),
            amt_timeout: Duration::from_millis(500),
            relay: self
                .addrs
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(","),
            relay_port: self.port,
            interface: Ipv4Addr::LOCALHOST,
            ..GatewayConfig::default()
        }
    }

    /// Everything recorded so far
    #[must_use]
    pub fn events(&self) -> Vec<RelayEvent> {
        self.shared
            .events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    /// Recorded membership updates in arrival order
    #[must_use]
    pub fn updates(&self) -> Vec<MembershipUpdate> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                RelayEvent::Update { update, .. } => Some(update),
                _ => None,
            })
            .collect()
    }

    /// Data packets sent so far
    #[must_use]
    pub fn packets_sent(&self) -> usize {
        self.shared.sent.load(Ordering::SeqCst)
    }
}

impl Drop for MockRelay {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn bind_shared_port(specs: &[RelaySpec]) -> io::Result<(u16, Vec<UdpSocket>)> {
    let mut last_err = io::Error::new(io::ErrorKind::InvalidInput, "no relay addresses");

    for _ in 0..16 {
        let Some(first) = specs.first() else {
            break;
        };
        let first_socket = UdpSocket::bind((first.addr, 0)).await?;
        let port = first_socket.local_addr()?.port();

        let mut sockets = vec![first_socket];
        let mut failed = None;
        for spec in &specs[1..] {
            match UdpSocket::bind((spec.addr, port)).await {
                Ok(socket) => sockets.push(socket),
                Err(e) => {
                    failed = Some(e);
                    break;
                }
            }
        }

        match failed {
            None => return Ok((port, sockets)),
            Some(e) => last_err = e,
        }
    }
    Err(last_err)
}

async fn serve(spec: RelaySpec, port: u16, socket: Arc<UdpSocket>, shared: Arc<Shared>) {
    let Ok(at) = socket.local_addr() else {
        return;
    };
    let mut buf = vec![0u8; 2048];

    loop {
        let Ok((len, peer)) = socket.recv_from(&mut buf).await else {
            continue;
        };
        let data = &buf[..len];

        match MessageType::peek(data) {
            Ok(MessageType::RelayDiscovery) => {
                let Ok(discovery) = RelayDiscovery::decode(data) else {
                    continue;
                };
                shared.record(RelayEvent::Discovery {
                    at,
                    nonce: discovery.nonce,
                });

                let nonce = match spec.behavior {
                    Behavior::Silent => continue,
                    Behavior::WrongNonce => !discovery.nonce,
                    Behavior::Normal | Behavior::NoData | Behavior::WrongQueryNonce => {
                        discovery.nonce
                    }
                };
                let advertisement = RelayAdvertisement {
                    nonce,
                    relay: spec.advertise.unwrap_or(spec.addr),
                };
                let _ = socket.send_to(&advertisement.encode(), peer).await;
            }
            Ok(MessageType::Request) => {
                let Ok(request) = RelayRequest::decode(data) else {
                    continue;
                };
                shared.record(RelayEvent::Request {
                    at,
                    nonce: request.nonce,
                });
                if spec.behavior == Behavior::Silent {
                    continue;
                }

                let nonce = match spec.behavior {
                    Behavior::WrongQueryNonce => !request.nonce,
                    _ => request.nonce,
                };
                let query = MembershipQuery {
                    mac: shared.options.mac,
                    nonce,
                    query: IgmpQuery::general(shared.options.qqic),
                };
                let _ = socket.send_to(&query.encode(), peer).await;
            }
            Ok(MessageType::MembershipUpdate) => {
                let Ok(update) = MembershipUpdate::decode(data) else {
                    continue;
                };
                let leave = update.is_leave();
                let group = update.record.group;
                let nonce = update.nonce;
                shared.record(RelayEvent::Update { at, update });

                if leave {
                    shared.left.store(true, Ordering::SeqCst);
                } else if spec.behavior == Behavior::Normal
                    && !shared.streaming.swap(true, Ordering::SeqCst)
                {
                    tokio::spawn(stream(
                        Arc::clone(&socket),
                        peer,
                        group,
                        port,
                        nonce,
                        Arc::clone(&shared),
                    ));
                }
            }
            Ok(other) => shared.record(RelayEvent::Other {
                at,
                type_byte: other as u8,
            }),
            Err(_) => shared.record(RelayEvent::Other {
                at,
                type_byte: data.first().copied().unwrap_or_default(),
            }),
        }
    }
}

async fn stream(
    socket: Arc<UdpSocket>,
    gateway: SocketAddr,
    group: Ipv4Addr,
    port: u16,
    nonce: u32,
    shared: Arc<Shared>,
) {
    let options = &shared.options;
    for index in 0..options.packets {
        if shared.left.load(Ordering::SeqCst) {
            return;
        }

        if options.requery_after == Some(index) {
            let query = MembershipQuery {
                mac: options.requery_mac,
                nonce,
                query: IgmpQuery::general(options.qqic),
            };
            let _ = socket.send_to(&query.encode(), gateway).await;
        }

        let mut datagram = MulticastData::encode(
            Ipv4Addr::new(198, 51, 100, 1),
            group,
            port,
            &payload_for(index, options.payload_len),
        );
        if options.truncate_packet == Some(index) {
            datagram.truncate(TRUNCATED_LEN);
        }
        if socket.send_to(&datagram, gateway).await.is_ok() {
            shared.sent.fetch_add(1, Ordering::SeqCst);
        }
        tokio::time::sleep(options.packet_gap).await;
    }
}
