pub mod config;
pub mod error;
pub mod json;
pub mod value;
pub mod xml;

pub use config::BridgeConfig;
pub use error::BridgeError;
pub use json::{from_json, json_path, parse_json, strip_nulls};
pub use value::*;
pub use xml::{XmlDocument, XmlElement, XmlNode, XmlSelection};
