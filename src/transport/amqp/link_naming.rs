//! Link, source, target and address naming
//!
//! Link names embed a connection-wide counter so they never collide over the
//! lifetime of one shared connection, even when a device unregisters and a new
//! device with the same id registers later.

/// Tag used in the names of device-to-cloud links
pub const SENDER_LINK_TAG: &str = "sender";

/// Tag used in the names of cloud-to-device links
pub const RECEIVER_LINK_TAG: &str = "receiver";

/// Build `link-<device_id>-<tag>-<index>`
pub fn create_link_name(device_id: &str, tag: &str, index: u64) -> String {
    format!("link-{device_id}-{tag}-{index}")
}

/// Build `<link_name>-source`
pub fn create_source_name(link_name: &str) -> String {
    format!("{link_name}-source")
}

/// Build `<link_name>-target`
pub fn create_target_name(link_name: &str) -> String {
    format!("{link_name}-target")
}

/// Addresses derived from a device id and the hub host at registration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceAddresses {
    /// `<host>/devices/<device_id>`
    pub devices_path: String,
    /// `amqps://<devices_path>/messages/events`
    pub target_address: String,
    /// `amqps://<devices_path>/messages/devicebound`
    pub receive_address: String,
}

impl DeviceAddresses {
    pub fn derive(host_fqdn: &str, device_id: &str) -> Self {
        let devices_path = format!("{host_fqdn}/devices/{device_id}");
        Self {
            target_address: format!("amqps://{devices_path}/messages/events"),
            receive_address: format!("amqps://{devices_path}/messages/devicebound"),
            devices_path,
        }
    }
}

/// Hands out link indices for one transport; never reset.
#[derive(Debug, Default)]
pub struct LinkCounter(u64);

impl LinkCounter {
    /// Return the current index and advance.
    pub fn next_index(&mut self) -> u64 {
        let index = self.0;
        self.0 = self.0.wrapping_add(1);
        index
    }

    pub fn issued(&self) -> u64 {
        self.0
    }
}
