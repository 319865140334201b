/*!
 * Status widgets
 * Block renderers for the i3bar protocol stream
 */

pub mod clock;
pub mod wireless;

use serde::Serialize;

/// One block of the status record.
#[derive(Serialize)]
pub struct Block<'a> {
    pub name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance: Option<&'a str>,
    pub full_text: &'a str,
}

impl Block<'_> {
    pub fn render(&self) -> Option<String> {
        serde_json::to_string(self).ok()
    }
}
