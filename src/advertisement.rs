//! BLE advertisement events as delivered by the scanner backends.
//!
//! Every backend reduces what it receives to the same shape: the device
//! address, the signal strength and the advertised AD structures in order,
//! with their payloads hex-encoded.

/// AD type for flags.
pub const AD_TYPE_FLAGS: u8 = 0x01;
/// AD type for a shortened local name.
pub const AD_TYPE_SHORT_LOCAL_NAME: u8 = 0x08;
/// AD type for a complete local name.
pub const AD_TYPE_COMPLETE_LOCAL_NAME: u8 = 0x09;
/// AD type for manufacturer-specific data.
pub const AD_TYPE_MANUFACTURER_DATA: u8 = 0xFF;

/// Human-readable description of an AD type.
pub fn describe_ad_type(ad_type: u8) -> &'static str {
    match ad_type {
        AD_TYPE_FLAGS => "Flags",
        0x02 => "Incomplete 16b Services",
        0x03 => "Complete 16b Services",
        0x04 => "Incomplete 32b Services",
        0x05 => "Complete 32b Services",
        0x06 => "Incomplete 128b Services",
        0x07 => "Complete 128b Services",
        AD_TYPE_SHORT_LOCAL_NAME => "Short Local Name",
        AD_TYPE_COMPLETE_LOCAL_NAME => "Complete Local Name",
        0x0A => "Tx Power",
        0x16 => "16b Service Data",
        0x19 => "Appearance",
        0x20 => "32b Service Data",
        0x21 => "128b Service Data",
        AD_TYPE_MANUFACTURER_DATA => "Manufacturer",
        _ => "Unknown",
    }
}

/// One AD structure of an advertisement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdField {
    /// AD type code
    pub ad_type: u8,
    /// Description of the type code
    pub description: String,
    /// Payload as an even-length hex string
    pub value: String,
}

impl AdField {
    /// Build a field from a raw payload.
    pub fn new(ad_type: u8, payload: &[u8]) -> Self {
        Self {
            ad_type,
            description: describe_ad_type(ad_type).to_string(),
            value: hex::encode(payload),
        }
    }

    /// Build a manufacturer-data field from a company identifier and the data following it.
    ///
    /// The company identifier is written first, in little-endian order as it
    /// appears on the air, so the result matches what a raw AD structure holds.
    pub fn manufacturer(company_id: u16, data: &[u8]) -> Self {
        let mut payload = Vec::with_capacity(2 + data.len());
        payload.extend_from_slice(&company_id.to_le_bytes());
        payload.extend_from_slice(data);
        Self::new(AD_TYPE_MANUFACTURER_DATA, &payload)
    }
}

/// A single discovery event for one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    /// Device address, e.g. "c8:0f:10:aa:bb:cc"
    pub address: String,
    /// Received signal strength in dBm
    pub rssi: i16,
    /// AD structures in the order they were advertised
    pub fields: Vec<AdField>,
}

impl Advertisement {
    pub fn new(address: impl Into<String>, rssi: i16, fields: Vec<AdField>) -> Self {
        Self {
            address: address.into(),
            rssi,
            fields,
        }
    }

    /// First field with the given AD type.
    pub fn field(&self, ad_type: u8) -> Option<&AdField> {
        self.fields.iter().find(|f| f.ad_type == ad_type)
    }

    /// Hex value of the first manufacturer-specific data field.
    pub fn manufacturer_data(&self) -> Option<&str> {
        self.field(AD_TYPE_MANUFACTURER_DATA)
            .map(|f| f.value.as_str())
    }

    /// Advertised local name, complete or shortened, whichever comes first.
    pub fn local_name(&self) -> Option<String> {
        self.fields
            .iter()
            .find(|f| {
                f.ad_type == AD_TYPE_COMPLETE_LOCAL_NAME || f.ad_type == AD_TYPE_SHORT_LOCAL_NAME
            })
            .and_then(|f| hex::decode(&f.value).ok())
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
    }
}

/// Format a device address in the usual colon-separated lowercase form.
///
/// `bytes` must be in display order (most significant byte first).
pub fn format_address(bytes: [u8; 6]) -> String {
    format!(
        "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5]
    )
}

/// Split an advertising payload into its AD structures.
///
/// Parsing stops at a zero-length structure or at one that runs past the end
/// of the payload; everything before it is kept.
pub fn parse_ad_structures(data: &[u8]) -> Vec<AdField> {
    let mut fields = Vec::new();
    let mut offset = 0;

    while offset < data.len() {
        let len = data[offset] as usize;
        if len == 0 || offset + 1 + len > data.len() {
            break;
        }

        let ad_type = data[offset + 1];
        fields.push(AdField::new(ad_type, &data[offset + 2..offset + 1 + len]));

        offset += 1 + len;
    }

    fields
}
