/*!
 * nl80211 client
 * One non-blocking socket subscribed to the wireless multicast groups,
 * one blocking socket for synchronous interface queries
 */

pub mod attrs;
pub mod message;

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::rc::Rc;

use anyhow::{bail, Context, Result};
use netlink_packet_core::{NetlinkMessage, NetlinkPayload, NLM_F_DUMP, NLM_F_REQUEST};
use netlink_packet_generic::ctrl::nlas::{GenlCtrlAttrs, McastGrpAttrs};
use netlink_packet_generic::ctrl::{GenlCtrl, GenlCtrlCmd};
use netlink_packet_generic::GenlMessage;
use netlink_packet_utils::DecodeError;
use netlink_sys::{protocols, Socket, SocketAddr};
use nix::net::if_::if_nametoindex;
use thiserror::Error;
use tracing::{debug, warn};

use crate::event_loop::{EventLoop, Widget};

pub use attrs::InterfaceSnapshot;
use attrs::Nl80211Attr;
use message::{Nl80211Command, Nl80211Message, FAMILY_NAME};

const MULTICAST_GROUPS: [&str; 5] = ["config", "scan", "regulatory", "mlme", "vendor"];

/// Receives every validated wireless protocol message, raw. Parsing is
/// the listener's business; most listeners only treat the message as a
/// "something changed" signal.
pub trait Nl80211Listener {
    fn on_event(&self, raw: &[u8]);
}

/// A query that could not complete. The snapshot passed to the query is
/// left as far as it got; the caller may retry on its next wake.
#[derive(Debug, Error)]
pub enum QueryError {
    #[error("failed to send wireless query: {0}")]
    Send(#[source] io::Error),
    #[error("failed to receive wireless reply: {0}")]
    Receive(#[source] io::Error),
    #[error("malformed wireless reply: {0}")]
    Decode(#[from] DecodeError),
    #[error("kernel rejected wireless query: {0}")]
    Kernel(#[source] io::Error),
}

pub struct Nl80211 {
    family_id: u16,
    event_socket: Socket,
    query_socket: Socket,
    next_sequence: Cell<u32>,
    listeners: RefCell<Vec<Rc<dyn Nl80211Listener>>>,
}

impl Nl80211 {
    /// Opens both sockets, resolves the family, and registers the event
    /// socket with the readiness loop. Any failure here is an
    /// environment problem the program cannot run without, so the error
    /// is meant to terminate startup.
    pub fn new(event_loop: &mut EventLoop) -> Result<Rc<Self>> {
        let mut query_socket =
            Socket::new(protocols::NETLINK_GENERIC).context("create wireless query socket")?;
        query_socket
            .bind_auto()
            .context("bind wireless query socket")?;
        query_socket
            .connect(&SocketAddr::new(0, 0))
            .context("connect wireless query socket")?;

        let family = resolve_family(&query_socket, 1).context("resolve nl80211 family")?;
        debug!("nl80211 family id: {}", family.id);

        let mut event_socket =
            Socket::new(protocols::NETLINK_GENERIC).context("create wireless event socket")?;
        event_socket
            .bind_auto()
            .context("bind wireless event socket")?;
        event_socket
            .connect(&SocketAddr::new(0, 0))
            .context("connect wireless event socket")?;
        for group in &MULTICAST_GROUPS {
            let id = family
                .groups
                .get(*group)
                .with_context(|| format!("nl80211 lacks multicast group {}", group))?;
            event_socket
                .add_membership(*id)
                .with_context(|| format!("join nl80211 multicast group {}", group))?;
        }
        event_socket
            .set_non_blocking(true)
            .context("set wireless event socket non-blocking")?;

        let client = Rc::new(Self {
            family_id: family.id,
            event_socket,
            query_socket,
            next_sequence: Cell::new(1),
            listeners: RefCell::new(Vec::new()),
        });
        event_loop.register_source(client.clone(), client.event_fd())?;
        Ok(client)
    }

    fn event_fd(&self) -> RawFd {
        self.event_socket.as_raw_fd()
    }

    /// Listeners live as long as the client; there is no removal.
    pub fn add_listener(&self, listener: Rc<dyn Nl80211Listener>) {
        self.listeners.borrow_mut().push(listener);
    }

    /// Queries current wireless state for `interface` into `snapshot`.
    /// An unknown interface or a missing association is a normal
    /// outcome (`connected` stays false), not an error. Blocks for the
    /// duration of up to two request/response round trips.
    pub fn query_interface(
        &self,
        interface: &str,
        snapshot: &mut InterfaceSnapshot,
    ) -> Result<(), QueryError> {
        snapshot.reset();

        let ifindex = match if_nametoindex(interface) {
            Ok(index) => index,
            Err(err) => {
                debug!("interface {} not found: {}", interface, err);
                return Ok(());
            }
        };

        let mut transport = self;
        run_interface_query(&mut transport, ifindex, snapshot)
    }

    fn drain_events(&self) {
        loop {
            match self.event_socket.recv_from_full() {
                Ok((datagram, _)) => self.dispatch_datagram(&datagram),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    warn!("wireless event socket receive failed: {}", err);
                    break;
                }
            }
        }
    }

    /// Events are unsolicited, so sequence numbers are not checked
    /// here. Each framed message is handed to the listeners as-is.
    fn dispatch_datagram(&self, datagram: &[u8]) {
        let mut offset = 0;
        while offset < datagram.len() {
            let bytes = &datagram[offset..];
            let message = match NetlinkMessage::<GenlMessage<Nl80211Message>>::deserialize(bytes) {
                Ok(message) => message,
                Err(err) => {
                    debug!("dropping undecodable wireless event: {}", err);
                    return;
                }
            };
            let length = message.header.length as usize;
            if length == 0 {
                return;
            }
            if matches!(message.payload, NetlinkPayload::InnerMessage(_)) {
                let raw = &bytes[..length.min(bytes.len())];
                for listener in self.listeners.borrow().iter() {
                    listener.on_event(raw);
                }
            }
            offset += length;
        }
    }

    /// One dump-flagged request, all replies of the matching sequence
    /// collected until the kernel's termination marker.
    fn dump_request(&self, request: Nl80211Message) -> Result<Vec<Nl80211Message>, QueryError> {
        let sequence = self.next_sequence.get().wrapping_add(1);
        self.next_sequence.set(sequence);

        let mut genl = GenlMessage::from_payload(request);
        genl.set_resolved_family_id(self.family_id);
        let mut packet = NetlinkMessage::from(genl);
        packet.header.flags = NLM_F_REQUEST | NLM_F_DUMP;
        packet.header.sequence_number = sequence;
        packet.finalize();

        let mut buffer = vec![0u8; packet.buffer_len()];
        packet.serialize(&mut buffer);
        self.query_socket
            .send(&buffer, 0)
            .map_err(QueryError::Send)?;

        let mut messages = Vec::new();
        loop {
            let (datagram, _) = self
                .query_socket
                .recv_from_full()
                .map_err(QueryError::Receive)?;
            let mut offset = 0;
            while offset < datagram.len() {
                let bytes = &datagram[offset..];
                let reply = NetlinkMessage::<GenlMessage<Nl80211Message>>::deserialize(bytes)?;
                let length = reply.header.length as usize;
                if reply.header.sequence_number == sequence {
                    match reply.payload {
                        NetlinkPayload::Done(_) => return Ok(messages),
                        NetlinkPayload::Error(err) => {
                            return match err.code {
                                Some(code) => Err(QueryError::Kernel(
                                    io::Error::from_raw_os_error(code.get().abs()),
                                )),
                                None => Ok(messages),
                            };
                        }
                        NetlinkPayload::InnerMessage(inner) => messages.push(inner.payload),
                        _ => {}
                    }
                }
                if length == 0 {
                    break;
                }
                offset += length;
            }
        }
    }
}

impl Widget for Nl80211 {
    fn on_ready(&self) {
        self.drain_events();
    }
}

/// The request/response channel behind a query, narrow enough to mock.
pub(crate) trait DumpTransport {
    fn dump(&mut self, request: Nl80211Message) -> Result<Vec<Nl80211Message>, QueryError>;
}

impl DumpTransport for &Nl80211 {
    fn dump(&mut self, request: Nl80211Message) -> Result<Vec<Nl80211Message>, QueryError> {
        self.dump_request(request)
    }
}

/// Two-phase interface query: scan results first, then, only for an
/// associated interface, station statistics keyed by the discovered
/// peer. The snapshot keeps whatever a failed call managed to fill.
pub(crate) fn run_interface_query(
    transport: &mut dyn DumpTransport,
    ifindex: u32,
    snapshot: &mut InterfaceSnapshot,
) -> Result<(), QueryError> {
    let scan = Nl80211Message::new(Nl80211Command::GetScan, vec![Nl80211Attr::Ifindex(ifindex)]);
    for message in transport.dump(scan)? {
        attrs::apply_scan_result(&message, snapshot);
    }

    if !snapshot.connected {
        return Ok(());
    }

    let station = Nl80211Message::new(
        Nl80211Command::GetStation,
        vec![
            Nl80211Attr::Ifindex(ifindex),
            Nl80211Attr::Mac(snapshot.mac),
        ],
    );
    for message in transport.dump(station)? {
        attrs::apply_station_info(&message, snapshot);
    }
    Ok(())
}

struct FamilyInfo {
    id: u16,
    groups: HashMap<String, u32>,
}

/// Asks the generic netlink controller for the wireless family id and
/// its multicast group ids.
fn resolve_family(socket: &Socket, sequence: u32) -> Result<FamilyInfo> {
    let mut request = NetlinkMessage::from(GenlMessage::from_payload(GenlCtrl {
        cmd: GenlCtrlCmd::GetFamily,
        nlas: vec![GenlCtrlAttrs::FamilyName(FAMILY_NAME.to_owned())],
    }));
    request.header.flags = NLM_F_REQUEST;
    request.header.sequence_number = sequence;
    request.finalize();

    let mut buffer = vec![0u8; request.buffer_len()];
    request.serialize(&mut buffer);
    socket
        .send(&buffer, 0)
        .context("send generic netlink family query")?;

    let (reply, _) = socket
        .recv_from_full()
        .context("receive generic netlink family reply")?;
    let message = NetlinkMessage::<GenlMessage<GenlCtrl>>::deserialize(&reply)
        .context("decode generic netlink family reply")?;

    let genl = match message.payload {
        NetlinkPayload::InnerMessage(genl) => genl,
        NetlinkPayload::Error(err) => bail!("kernel refused family query: {:?}", err),
        other => bail!("unexpected family reply: {:?}", other),
    };

    let mut family_id = None;
    let mut groups = HashMap::new();
    for nla in genl.payload.nlas {
        match nla {
            GenlCtrlAttrs::FamilyId(id) => family_id = Some(id),
            GenlCtrlAttrs::McastGroups(entries) => {
                for entry in entries {
                    let mut name = None;
                    let mut id = None;
                    for attr in entry {
                        match attr {
                            McastGrpAttrs::Name(value) => name = Some(value),
                            McastGrpAttrs::Id(value) => id = Some(value),
                        }
                    }
                    if let (Some(name), Some(id)) = (name, id) {
                        groups.insert(name, id);
                    }
                }
            }
            _ => {}
        }
    }

    Ok(FamilyInfo {
        id: family_id.context("family id missing from reply")?,
        groups,
    })
}

#[cfg(test)]
mod tests {
    use super::attrs::{BssAttr, RateInfoAttr, StationInfoAttr};
    use super::*;
    use std::collections::VecDeque;

    struct MockTransport {
        requests: Vec<Nl80211Message>,
        replies: VecDeque<Result<Vec<Nl80211Message>, QueryError>>,
    }

    impl MockTransport {
        fn new(replies: Vec<Result<Vec<Nl80211Message>, QueryError>>) -> Self {
            Self {
                requests: Vec::new(),
                replies: replies.into(),
            }
        }
    }

    impl DumpTransport for MockTransport {
        fn dump(&mut self, request: Nl80211Message) -> Result<Vec<Nl80211Message>, QueryError> {
            self.requests.push(request);
            self.replies.pop_front().unwrap_or_else(|| Ok(Vec::new()))
        }
    }

    fn associated_bss(mac: [u8; 6], ssid: &[u8]) -> Nl80211Message {
        let mut ies = vec![0u8, ssid.len() as u8];
        ies.extend_from_slice(ssid);
        Nl80211Message::new(
            Nl80211Command::Other(34),
            vec![Nl80211Attr::Bss(vec![
                BssAttr::Status(1),
                BssAttr::Bssid(mac),
                BssAttr::InformationElements(ies),
            ])],
        )
    }

    #[test]
    fn no_association_issues_no_station_request() {
        let mut transport = MockTransport::new(vec![Ok(vec![])]);
        let mut snapshot = InterfaceSnapshot::default();

        run_interface_query(&mut transport, 4, &mut snapshot).unwrap();

        assert!(!snapshot.connected);
        assert_eq!(transport.requests.len(), 1);
        assert_eq!(transport.requests[0].cmd, Nl80211Command::GetScan);
    }

    #[test]
    fn association_triggers_station_request_keyed_by_mac() {
        let mac = [0xde, 0xad, 0xbe, 0xef, 0x00, 0x01];
        let mut transport = MockTransport::new(vec![
            Ok(vec![associated_bss(mac, b"home")]),
            Ok(vec![Nl80211Message::new(
                Nl80211Command::GetStation,
                vec![Nl80211Attr::StationInfo(vec![
                    StationInfoAttr::Signal(-48),
                    StationInfoAttr::RxBitrate(vec![RateInfoAttr::Bitrate32(8667)]),
                    StationInfoAttr::TxBitrate(vec![RateInfoAttr::Bitrate32(7800)]),
                ])],
            )]),
        ]);
        let mut snapshot = InterfaceSnapshot::default();

        run_interface_query(&mut transport, 4, &mut snapshot).unwrap();

        assert!(snapshot.connected);
        assert_eq!(snapshot.ssid_filtered, "home");
        assert_eq!(snapshot.signal_strength, -48);
        assert_eq!(snapshot.rx_bitrate, 8667);
        assert_eq!(snapshot.tx_bitrate, 7800);

        assert_eq!(transport.requests.len(), 2);
        assert_eq!(transport.requests[1].cmd, Nl80211Command::GetStation);
        assert!(transport.requests[1]
            .attributes
            .contains(&Nl80211Attr::Mac(mac)));
        assert!(transport.requests[1]
            .attributes
            .contains(&Nl80211Attr::Ifindex(4)));
    }

    #[test]
    fn transport_failure_keeps_partial_snapshot() {
        let mac = [2u8, 4, 6, 8, 10, 12];
        let mut transport = MockTransport::new(vec![
            Ok(vec![associated_bss(mac, b"office")]),
            Err(QueryError::Receive(io::Error::from(
                io::ErrorKind::ConnectionReset,
            ))),
        ]);
        let mut snapshot = InterfaceSnapshot::default();

        let result = run_interface_query(&mut transport, 7, &mut snapshot);

        assert!(result.is_err());
        // phase one results stay visible to the caller
        assert!(snapshot.connected);
        assert_eq!(snapshot.mac, mac);
    }

    #[test]
    fn later_scan_entries_do_not_displace_the_first() {
        let mut transport = MockTransport::new(vec![
            Ok(vec![
                associated_bss([1, 1, 1, 1, 1, 1], b"first"),
                associated_bss([2, 2, 2, 2, 2, 2], b"second"),
            ]),
            Ok(vec![]),
        ]);
        let mut snapshot = InterfaceSnapshot::default();

        run_interface_query(&mut transport, 4, &mut snapshot).unwrap();

        assert_eq!(snapshot.mac, [1, 1, 1, 1, 1, 1]);
        assert_eq!(snapshot.ssid_filtered, "first");
    }
}
