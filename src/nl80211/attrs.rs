/*!
 * nl80211 attribute decoding
 * Typed views over the kernel's nested attribute blocks, no I/O
 */

use netlink_packet_utils::nla::{DefaultNla, Nla, NlaBuffer, NlasIterator};
use netlink_packet_utils::parsers::{parse_mac, parse_u32, parse_u8};
use netlink_packet_utils::{DecodeError, Emitable, Parseable};

use super::message::Nl80211Message;

pub const ETH_ALEN: usize = 6;

const NL80211_ATTR_IFINDEX: u16 = 3;
const NL80211_ATTR_MAC: u16 = 6;
const NL80211_ATTR_STA_INFO: u16 = 21;
const NL80211_ATTR_BSS: u16 = 47;

const NL80211_BSS_BSSID: u16 = 1;
const NL80211_BSS_INFORMATION_ELEMENTS: u16 = 6;
const NL80211_BSS_STATUS: u16 = 9;

const NL80211_STA_INFO_SIGNAL: u16 = 7;
const NL80211_STA_INFO_TX_BITRATE: u16 = 8;
const NL80211_STA_INFO_RX_BITRATE: u16 = 14;

const NL80211_RATE_INFO_BITRATE32: u16 = 5;

/// Information-element id carrying the SSID.
const IE_SSID: u8 = 0;

/// Top-level nl80211 attributes, limited to the subset this program
/// sends or inspects. Everything else is retained as `Other` so that
/// unsolicited events never fail to decode.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Nl80211Attr {
    Ifindex(u32),
    Mac([u8; ETH_ALEN]),
    Bss(Vec<BssAttr>),
    StationInfo(Vec<StationInfoAttr>),
    Other(DefaultNla),
}

impl Nla for Nl80211Attr {
    fn value_len(&self) -> usize {
        match self {
            Self::Ifindex(_) => 4,
            Self::Mac(_) => ETH_ALEN,
            Self::Bss(nested) => nested.as_slice().buffer_len(),
            Self::StationInfo(nested) => nested.as_slice().buffer_len(),
            Self::Other(nla) => nla.value_len(),
        }
    }

    fn kind(&self) -> u16 {
        match self {
            Self::Ifindex(_) => NL80211_ATTR_IFINDEX,
            Self::Mac(_) => NL80211_ATTR_MAC,
            Self::Bss(_) => NL80211_ATTR_BSS,
            Self::StationInfo(_) => NL80211_ATTR_STA_INFO,
            Self::Other(nla) => nla.kind(),
        }
    }

    fn emit_value(&self, buffer: &mut [u8]) {
        match self {
            Self::Ifindex(value) => buffer[..4].copy_from_slice(&value.to_ne_bytes()),
            Self::Mac(mac) => buffer[..ETH_ALEN].copy_from_slice(mac),
            Self::Bss(nested) => nested.as_slice().emit(buffer),
            Self::StationInfo(nested) => nested.as_slice().emit(buffer),
            Self::Other(nla) => nla.emit_value(buffer),
        }
    }

    fn is_nested(&self) -> bool {
        matches!(self, Self::Bss(_) | Self::StationInfo(_))
    }
}

impl<'a, T: AsRef<[u8]> + ?Sized> Parseable<NlaBuffer<&'a T>> for Nl80211Attr {
    fn parse(buf: &NlaBuffer<&'a T>) -> Result<Self, DecodeError> {
        let payload = buf.value();
        Ok(match buf.kind() {
            NL80211_ATTR_IFINDEX => Self::Ifindex(parse_u32(payload)?),
            NL80211_ATTR_MAC => Self::Mac(parse_mac(payload)?),
            NL80211_ATTR_BSS => Self::Bss(parse_nested(payload)?),
            NL80211_ATTR_STA_INFO => Self::StationInfo(parse_nested(payload)?),
            _ => Self::Other(DefaultNla::parse(buf)?),
        })
    }
}

/// Attributes nested under `NL80211_ATTR_BSS`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BssAttr {
    Bssid([u8; ETH_ALEN]),
    Status(u32),
    InformationElements(Vec<u8>),
    Other(DefaultNla),
}

impl Nla for BssAttr {
    fn value_len(&self) -> usize {
        match self {
            Self::Bssid(_) => ETH_ALEN,
            Self::Status(_) => 4,
            Self::InformationElements(ies) => ies.len(),
            Self::Other(nla) => nla.value_len(),
        }
    }

    fn kind(&self) -> u16 {
        match self {
            Self::Bssid(_) => NL80211_BSS_BSSID,
            Self::Status(_) => NL80211_BSS_STATUS,
            Self::InformationElements(_) => NL80211_BSS_INFORMATION_ELEMENTS,
            Self::Other(nla) => nla.kind(),
        }
    }

    fn emit_value(&self, buffer: &mut [u8]) {
        match self {
            Self::Bssid(mac) => buffer[..ETH_ALEN].copy_from_slice(mac),
            Self::Status(value) => buffer[..4].copy_from_slice(&value.to_ne_bytes()),
            Self::InformationElements(ies) => buffer[..ies.len()].copy_from_slice(ies),
            Self::Other(nla) => nla.emit_value(buffer),
        }
    }
}

impl<'a, T: AsRef<[u8]> + ?Sized> Parseable<NlaBuffer<&'a T>> for BssAttr {
    fn parse(buf: &NlaBuffer<&'a T>) -> Result<Self, DecodeError> {
        let payload = buf.value();
        Ok(match buf.kind() {
            NL80211_BSS_BSSID => Self::Bssid(parse_mac(payload)?),
            NL80211_BSS_STATUS => Self::Status(parse_u32(payload)?),
            NL80211_BSS_INFORMATION_ELEMENTS => Self::InformationElements(payload.to_vec()),
            _ => Self::Other(DefaultNla::parse(buf)?),
        })
    }
}

/// Attributes nested under `NL80211_ATTR_STA_INFO`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StationInfoAttr {
    Signal(i8),
    TxBitrate(Vec<RateInfoAttr>),
    RxBitrate(Vec<RateInfoAttr>),
    Other(DefaultNla),
}

impl Nla for StationInfoAttr {
    fn value_len(&self) -> usize {
        match self {
            Self::Signal(_) => 1,
            Self::TxBitrate(nested) | Self::RxBitrate(nested) => nested.as_slice().buffer_len(),
            Self::Other(nla) => nla.value_len(),
        }
    }

    fn kind(&self) -> u16 {
        match self {
            Self::Signal(_) => NL80211_STA_INFO_SIGNAL,
            Self::TxBitrate(_) => NL80211_STA_INFO_TX_BITRATE,
            Self::RxBitrate(_) => NL80211_STA_INFO_RX_BITRATE,
            Self::Other(nla) => nla.kind(),
        }
    }

    fn emit_value(&self, buffer: &mut [u8]) {
        match self {
            Self::Signal(value) => buffer[0] = *value as u8,
            Self::TxBitrate(nested) | Self::RxBitrate(nested) => nested.as_slice().emit(buffer),
            Self::Other(nla) => nla.emit_value(buffer),
        }
    }

    fn is_nested(&self) -> bool {
        matches!(self, Self::TxBitrate(_) | Self::RxBitrate(_))
    }
}

impl<'a, T: AsRef<[u8]> + ?Sized> Parseable<NlaBuffer<&'a T>> for StationInfoAttr {
    fn parse(buf: &NlaBuffer<&'a T>) -> Result<Self, DecodeError> {
        let payload = buf.value();
        Ok(match buf.kind() {
            NL80211_STA_INFO_SIGNAL => Self::Signal(parse_u8(payload)? as i8),
            NL80211_STA_INFO_TX_BITRATE => Self::TxBitrate(parse_nested(payload)?),
            NL80211_STA_INFO_RX_BITRATE => Self::RxBitrate(parse_nested(payload)?),
            _ => Self::Other(DefaultNla::parse(buf)?),
        })
    }
}

/// Attributes nested under a station's rate-info block.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RateInfoAttr {
    /// Total bitrate in units of 100 kbit/s.
    Bitrate32(u32),
    Other(DefaultNla),
}

impl Nla for RateInfoAttr {
    fn value_len(&self) -> usize {
        match self {
            Self::Bitrate32(_) => 4,
            Self::Other(nla) => nla.value_len(),
        }
    }

    fn kind(&self) -> u16 {
        match self {
            Self::Bitrate32(_) => NL80211_RATE_INFO_BITRATE32,
            Self::Other(nla) => nla.kind(),
        }
    }

    fn emit_value(&self, buffer: &mut [u8]) {
        match self {
            Self::Bitrate32(value) => buffer[..4].copy_from_slice(&value.to_ne_bytes()),
            Self::Other(nla) => nla.emit_value(buffer),
        }
    }
}

impl<'a, T: AsRef<[u8]> + ?Sized> Parseable<NlaBuffer<&'a T>> for RateInfoAttr {
    fn parse(buf: &NlaBuffer<&'a T>) -> Result<Self, DecodeError> {
        Ok(match buf.kind() {
            NL80211_RATE_INFO_BITRATE32 => Self::Bitrate32(parse_u32(buf.value())?),
            _ => Self::Other(DefaultNla::parse(buf)?),
        })
    }
}

pub(crate) fn parse_nested<N>(payload: &[u8]) -> Result<Vec<N>, DecodeError>
where
    N: for<'a> Parseable<NlaBuffer<&'a [u8]>>,
{
    let mut attrs = Vec::new();
    for nla in NlasIterator::new(payload) {
        let nla = nla?;
        attrs.push(N::parse(&nla)?);
    }
    Ok(attrs)
}

/// Wireless state of one interface, filled in place by a query.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InterfaceSnapshot {
    pub connected: bool,
    pub mac: [u8; ETH_ALEN],
    pub ssid: Vec<u8>,
    /// Same length as `ssid`, printable ASCII only, `"` excluded.
    pub ssid_filtered: String,
    /// dBm, meaningful only while `connected`.
    pub signal_strength: i8,
    /// 100 kbit/s units, meaningful only while `connected`.
    pub rx_bitrate: u32,
    pub tx_bitrate: u32,
}

impl InterfaceSnapshot {
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Copies a raw SSID, substituting `?` for anything that is not
/// printable ASCII or that would break a quoted rendering.
pub fn printable_ssid(raw: &[u8]) -> String {
    raw.iter()
        .map(|&b| {
            if matches!(b, 0x20..=0x7e) && b != b'"' {
                b as char
            } else {
                '?'
            }
        })
        .collect()
}

/// Walks an information-element stream and returns the SSID element,
/// if any. A truncated or malformed tail ends the walk silently.
pub fn find_ssid(ies: &[u8]) -> Option<&[u8]> {
    let mut rest = ies;
    while rest.len() >= 2 {
        let id = rest[0];
        let len = rest[1] as usize;
        if len > rest.len() - 2 {
            break;
        }
        if id == IE_SSID {
            return Some(&rest[2..2 + len]);
        }
        rest = &rest[2 + len..];
    }
    None
}

/// Folds one scan-dump message into the snapshot. The first BSS entry
/// carrying both a status and a BSSID wins; every later entry in the
/// same dump is ignored.
pub(crate) fn apply_scan_result(message: &Nl80211Message, snapshot: &mut InterfaceSnapshot) {
    if snapshot.connected {
        return;
    }

    let Some(bss) = message.attributes.iter().find_map(|attr| match attr {
        Nl80211Attr::Bss(nested) => Some(nested),
        _ => None,
    }) else {
        return;
    };

    let mut bssid = None;
    let mut status = None;
    let mut ies = None;
    for attr in bss {
        match attr {
            BssAttr::Bssid(mac) => bssid = Some(*mac),
            BssAttr::Status(value) => status = Some(*value),
            BssAttr::InformationElements(data) => ies = Some(data.as_slice()),
            BssAttr::Other(_) => {}
        }
    }

    let (Some(mac), Some(_)) = (bssid, status) else {
        return;
    };

    snapshot.mac = mac;
    snapshot.ssid.clear();
    snapshot.ssid_filtered.clear();
    if let Some(ssid) = ies.and_then(find_ssid) {
        snapshot.ssid = ssid.to_vec();
        snapshot.ssid_filtered = printable_ssid(ssid);
    }
    snapshot.connected = true;
}

/// Folds one station-dump message into the snapshot. Absent fields
/// default to zero.
pub(crate) fn apply_station_info(message: &Nl80211Message, snapshot: &mut InterfaceSnapshot) {
    let Some(station) = message.attributes.iter().find_map(|attr| match attr {
        Nl80211Attr::StationInfo(nested) => Some(nested),
        _ => None,
    }) else {
        return;
    };

    snapshot.signal_strength = 0;
    snapshot.rx_bitrate = 0;
    snapshot.tx_bitrate = 0;

    for attr in station {
        match attr {
            StationInfoAttr::Signal(dbm) => snapshot.signal_strength = *dbm,
            StationInfoAttr::RxBitrate(rate) => snapshot.rx_bitrate = bitrate32(rate),
            StationInfoAttr::TxBitrate(rate) => snapshot.tx_bitrate = bitrate32(rate),
            StationInfoAttr::Other(_) => {}
        }
    }
}

fn bitrate32(rate: &[RateInfoAttr]) -> u32 {
    rate.iter()
        .find_map(|attr| match attr {
            RateInfoAttr::Bitrate32(value) => Some(*value),
            RateInfoAttr::Other(_) => None,
        })
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nl80211::message::{Nl80211Command, Nl80211Message};

    fn bss_message(bss: Vec<BssAttr>) -> Nl80211Message {
        Nl80211Message::new(Nl80211Command::Other(34), vec![Nl80211Attr::Bss(bss)])
    }

    #[test]
    fn ssid_filter_preserves_length_and_masks_unprintable() {
        let raw: Vec<u8> = vec![b'h', b'i', 0x00, 0xff, b'"', b' ', 0x7f];
        let filtered = printable_ssid(&raw);
        assert_eq!(filtered.len(), raw.len());
        assert_eq!(filtered, "hi??? ?");
    }

    #[test]
    fn ssid_filter_is_identity_on_plain_names() {
        let raw = b"CoffeeShop 5GHz";
        assert_eq!(printable_ssid(raw), "CoffeeShop 5GHz");
    }

    #[test]
    fn ie_walk_finds_ssid_and_skips_other_elements() {
        // supported-rates element first, then the SSID
        let ies = [1u8, 2, 0x82, 0x84, 0, 4, b'h', b'o', b'm', b'e'];
        assert_eq!(find_ssid(&ies), Some(&b"home"[..]));
    }

    #[test]
    fn ie_walk_stops_on_truncated_tail() {
        // second element declares 200 bytes but only 1 remains
        let ies = [1u8, 1, 0x82, 0, 200, b'x'];
        assert_eq!(find_ssid(&ies), None);
    }

    #[test]
    fn ie_walk_handles_trailing_garbage_of_one_byte() {
        let ies = [0u8, 2, b'o', b'k', 7];
        assert_eq!(find_ssid(&ies), Some(&b"ok"[..]));
    }

    #[test]
    fn ie_walk_on_empty_buffer() {
        assert_eq!(find_ssid(&[]), None);
    }

    #[test]
    fn first_qualifying_bss_entry_wins() {
        let mut snapshot = InterfaceSnapshot::default();
        let first = bss_message(vec![
            BssAttr::Status(1),
            BssAttr::Bssid([1, 2, 3, 4, 5, 6]),
            BssAttr::InformationElements(vec![0, 3, b'o', b'n', b'e']),
        ]);
        let second = bss_message(vec![
            BssAttr::Status(1),
            BssAttr::Bssid([9, 9, 9, 9, 9, 9]),
            BssAttr::InformationElements(vec![0, 3, b't', b'w', b'o']),
        ]);

        apply_scan_result(&first, &mut snapshot);
        apply_scan_result(&second, &mut snapshot);

        assert!(snapshot.connected);
        assert_eq!(snapshot.mac, [1, 2, 3, 4, 5, 6]);
        assert_eq!(snapshot.ssid_filtered, "one");
    }

    #[test]
    fn bss_entry_without_status_is_ignored() {
        let mut snapshot = InterfaceSnapshot::default();
        let unassociated = bss_message(vec![
            BssAttr::Bssid([1, 2, 3, 4, 5, 6]),
            BssAttr::InformationElements(vec![0, 2, b'n', b'o']),
        ]);

        apply_scan_result(&unassociated, &mut snapshot);
        assert!(!snapshot.connected);
    }

    #[test]
    fn station_info_defaults_to_zero_when_fields_absent() {
        let mut snapshot = InterfaceSnapshot {
            connected: true,
            signal_strength: -40,
            rx_bitrate: 123,
            tx_bitrate: 456,
            ..Default::default()
        };
        let message = Nl80211Message::new(
            Nl80211Command::GetStation,
            vec![Nl80211Attr::StationInfo(vec![])],
        );

        apply_station_info(&message, &mut snapshot);
        assert_eq!(snapshot.signal_strength, 0);
        assert_eq!(snapshot.rx_bitrate, 0);
        assert_eq!(snapshot.tx_bitrate, 0);
    }

    #[test]
    fn station_info_extracts_signal_and_bitrates() {
        let mut snapshot = InterfaceSnapshot::default();
        let message = Nl80211Message::new(
            Nl80211Command::GetStation,
            vec![Nl80211Attr::StationInfo(vec![
                StationInfoAttr::Signal(-52),
                StationInfoAttr::RxBitrate(vec![RateInfoAttr::Bitrate32(8667)]),
                StationInfoAttr::TxBitrate(vec![RateInfoAttr::Bitrate32(7800)]),
            ])],
        );

        apply_station_info(&message, &mut snapshot);
        assert_eq!(snapshot.signal_strength, -52);
        assert_eq!(snapshot.rx_bitrate, 8667);
        assert_eq!(snapshot.tx_bitrate, 7800);
    }

    #[test]
    fn message_without_station_container_is_no_information() {
        let mut snapshot = InterfaceSnapshot {
            connected: true,
            signal_strength: -40,
            ..Default::default()
        };
        let message = Nl80211Message::new(Nl80211Command::GetStation, vec![]);

        apply_station_info(&message, &mut snapshot);
        // untouched: the message carried nothing usable
        assert_eq!(snapshot.signal_strength, -40);
    }

    #[test]
    fn nested_attribute_round_trip() {
        let attrs = vec![
            Nl80211Attr::Ifindex(3),
            Nl80211Attr::Mac([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]),
        ];
        let mut buffer = vec![0u8; attrs.as_slice().buffer_len()];
        attrs.as_slice().emit(&mut buffer);

        let parsed: Vec<Nl80211Attr> = parse_nested(&buffer).unwrap();
        assert_eq!(parsed, attrs);
    }

    #[test]
    fn malformed_nesting_is_a_decode_error() {
        // attribute header declares 64 bytes of payload, buffer has 4
        let buffer = [64u8, 0, NL80211_ATTR_BSS as u8, 0];
        assert!(parse_nested::<Nl80211Attr>(&buffer).is_err());
    }
}
