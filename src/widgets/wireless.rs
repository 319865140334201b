//! Wireless-link widget.
//!
//! Refreshes on wireless protocol events and on a periodic timer; each
//! refresh synchronously re-queries the interface. While the interface
//! is down, unassociated, or a query has just failed, the widget
//! renders nothing and drops out of the record.

use std::cell::RefCell;
use std::rc::Rc;

use tracing::{debug, warn};

use super::Block;
use crate::event_loop::Widget;
use crate::nl80211::{InterfaceSnapshot, Nl80211, Nl80211Listener};
use crate::timer::TimerListener;

pub struct WirelessWidget {
    interface: String,
    client: Rc<Nl80211>,
    text: RefCell<Option<String>>,
}

impl WirelessWidget {
    pub fn new(interface: String, client: Rc<Nl80211>) -> Rc<Self> {
        Rc::new(Self {
            interface,
            client,
            text: RefCell::new(None),
        })
    }

    pub fn refresh(&self) {
        let mut snapshot = InterfaceSnapshot::default();
        match self.client.query_interface(&self.interface, &mut snapshot) {
            Ok(()) if snapshot.connected => {
                *self.text.borrow_mut() = format_status(&self.interface, &snapshot);
            }
            Ok(()) => {
                debug!("{} has no association", self.interface);
                *self.text.borrow_mut() = None;
            }
            Err(err) => {
                warn!("wireless query for {} failed: {}", self.interface, err);
                *self.text.borrow_mut() = None;
            }
        }
    }
}

fn format_status(interface: &str, snapshot: &InterfaceSnapshot) -> Option<String> {
    // bitrates arrive in 100 kbit/s units
    let full_text = format!(
        "{}: {} {} dBm rx {:.1} tx {:.1} Mbit/s",
        interface,
        snapshot.ssid_filtered,
        snapshot.signal_strength,
        f64::from(snapshot.rx_bitrate) / 10.0,
        f64::from(snapshot.tx_bitrate) / 10.0,
    );
    Block {
        name: "wireless",
        instance: Some(interface),
        full_text: &full_text,
    }
    .render()
}

impl Widget for WirelessWidget {
    fn render(&self) -> Option<String> {
        self.text.borrow().clone()
    }
}

impl Nl80211Listener for WirelessWidget {
    fn on_event(&self, _raw: &[u8]) {
        self.refresh();
    }
}

impl TimerListener for WirelessWidget {
    fn on_tick(&self) {
        self.refresh();
    }
}
