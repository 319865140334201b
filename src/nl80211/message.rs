/*!
 * nl80211 generic netlink message type
 * Command + attribute payload behind the family's genl header
 */

use netlink_packet_generic::{GenlFamily, GenlHeader};
use netlink_packet_utils::{DecodeError, Emitable, ParseableParametrized};

use super::attrs::{parse_nested, Nl80211Attr};

const NL80211_CMD_GET_STATION: u8 = 17;
const NL80211_CMD_GET_SCAN: u8 = 32;

pub const FAMILY_NAME: &str = "nl80211";

/// Commands this program issues, with a catch-all for the many event
/// commands the kernel multicasts at us.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Nl80211Command {
    GetStation,
    GetScan,
    Other(u8),
}

impl From<Nl80211Command> for u8 {
    fn from(cmd: Nl80211Command) -> Self {
        match cmd {
            Nl80211Command::GetStation => NL80211_CMD_GET_STATION,
            Nl80211Command::GetScan => NL80211_CMD_GET_SCAN,
            Nl80211Command::Other(raw) => raw,
        }
    }
}

impl From<u8> for Nl80211Command {
    fn from(raw: u8) -> Self {
        match raw {
            NL80211_CMD_GET_STATION => Self::GetStation,
            NL80211_CMD_GET_SCAN => Self::GetScan,
            other => Self::Other(other),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Nl80211Message {
    pub cmd: Nl80211Command,
    pub attributes: Vec<Nl80211Attr>,
}

impl Nl80211Message {
    pub fn new(cmd: Nl80211Command, attributes: Vec<Nl80211Attr>) -> Self {
        Self { cmd, attributes }
    }
}

impl GenlFamily for Nl80211Message {
    fn family_name() -> &'static str {
        FAMILY_NAME
    }

    fn command(&self) -> u8 {
        self.cmd.into()
    }

    fn version(&self) -> u8 {
        1
    }
}

impl Emitable for Nl80211Message {
    fn buffer_len(&self) -> usize {
        self.attributes.as_slice().buffer_len()
    }

    fn emit(&self, buffer: &mut [u8]) {
        self.attributes.as_slice().emit(buffer)
    }
}

impl ParseableParametrized<[u8], GenlHeader> for Nl80211Message {
    fn parse_with_param(buffer: &[u8], header: GenlHeader) -> Result<Self, DecodeError> {
        Ok(Self {
            cmd: header.cmd.into(),
            attributes: parse_nested(buffer)?,
        })
    }
}
