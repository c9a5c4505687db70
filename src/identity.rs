//! Device identification data.
//!
//! Backs report-slave-id (fc 17) and read-device-identification (fc 43).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Standard device identification object ids
pub const OBJECT_VENDOR_NAME: u8 = 0x00;
pub const OBJECT_PRODUCT_CODE: u8 = 0x01;
pub const OBJECT_REVISION: u8 = 0x02;
pub const OBJECT_VENDOR_URL: u8 = 0x03;
pub const OBJECT_PRODUCT_NAME: u8 = 0x04;
pub const OBJECT_MODEL_NAME: u8 = 0x05;
pub const OBJECT_USER_APPLICATION_NAME: u8 = 0x06;

/// Identity advertised by the server.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub vendor_name: String,
    pub product_code: String,
    pub revision: String,
    pub vendor_url: Option<String>,
    pub product_name: Option<String>,
    pub model_name: Option<String>,
    pub user_application_name: Option<String>,
    /// Extended objects (ids 0x80 and up)
    #[serde(default)]
    pub extended: BTreeMap<u8, String>,
}

impl DeviceIdentity {
    /// Objects of the basic category (ids 0x00..=0x02), always present.
    fn basic_objects(&self) -> Vec<(u8, String)> {
        vec![
            (OBJECT_VENDOR_NAME, self.vendor_name.clone()),
            (OBJECT_PRODUCT_CODE, self.product_code.clone()),
            (OBJECT_REVISION, self.revision.clone()),
        ]
    }

    /// Objects of the regular category (ids 0x03..=0x06) that are set.
    fn regular_objects(&self) -> Vec<(u8, String)> {
        [
            (OBJECT_VENDOR_URL, &self.vendor_url),
            (OBJECT_PRODUCT_NAME, &self.product_name),
            (OBJECT_MODEL_NAME, &self.model_name),
            (OBJECT_USER_APPLICATION_NAME, &self.user_application_name),
        ]
        .into_iter()
        .filter_map(|(id, value)| value.as_ref().map(|v| (id, v.clone())))
        .collect()
    }

    /// Objects returned for a read-device-identification request.
    ///
    /// `read_code` 1 returns basic objects, 2 basic + regular, 3 all,
    /// 4 the single object `object_id`. Returns `None` when the requested
    /// individual object does not exist.
    pub fn objects(&self, read_code: u8, object_id: u8) -> Option<Vec<(u8, String)>> {
        match read_code {
            1 => Some(self.basic_objects()),
            2 => {
                let mut objects = self.basic_objects();
                objects.extend(self.regular_objects());
                Some(objects)
            }
            3 => {
                let mut objects = self.basic_objects();
                objects.extend(self.regular_objects());
                objects.extend(self.extended.iter().map(|(id, v)| (*id, v.clone())));
                Some(objects)
            }
            4 => self
                .object(object_id)
                .map(|value| vec![(object_id, value)]),
            _ => None,
        }
    }

    fn object(&self, object_id: u8) -> Option<String> {
        match object_id {
            OBJECT_VENDOR_NAME => Some(self.vendor_name.clone()),
            OBJECT_PRODUCT_CODE => Some(self.product_code.clone()),
            OBJECT_REVISION => Some(self.revision.clone()),
            OBJECT_VENDOR_URL => self.vendor_url.clone(),
            OBJECT_PRODUCT_NAME => self.product_name.clone(),
            OBJECT_MODEL_NAME => self.model_name.clone(),
            OBJECT_USER_APPLICATION_NAME => self.user_application_name.clone(),
            other => self.extended.get(&other).cloned(),
        }
    }

    /// Free-form identity string for report-slave-id (fc 17).
    pub fn summary(&self) -> String {
        if self.product_name.is_some() || !self.vendor_name.is_empty() {
            format!(
                "{} {}",
                self.vendor_name,
                self.product_name.as_deref().unwrap_or(&self.product_code)
            )
            .trim()
            .to_string()
        } else {
            String::new()
        }
    }
}
