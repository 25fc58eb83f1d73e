//! Information element registry.
//!
//! The [`InfoModel`] is an append-only registry of [`InfoElement`] definitions
//! keyed by `(enterprise number, element id)` and by name. Elements are handed
//! out as `Arc<InfoElement>`, so templates keep them alive independently of the
//! registry lock.
//!
//! # Example
//!
//! ```ignore
//! let model = InfoModel::with_defaults();
//! model.load_file("enterprise-elements.json5")?;
//!
//! let ie = model.lookup_by_name("sourceIPv4Address").unwrap();
//! assert_eq!(ie.id, 8);
//! ```

mod builtin;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use crate::error::{Error, Result};

pub use builtin::{CERT_PEN, builtin_elements};

/// Length marker for variable-length elements and fields.
pub const VARLEN: u16 = 0xFFFF;

/// Enterprise number of IANA-assigned elements.
pub const IANA_PEN: u32 = 0;

/// Enterprise number of RFC 5103 reverse elements.
pub const REVERSE_PEN: u32 = 29305;

/// Id bit marking the reverse of an enterprise-specific element.
pub const REVERSE_ID_BIT: u16 = 0x4000;

/// Abstract data types (RFC 7012 / RFC 6313 numbering).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[repr(u8)]
pub enum DataType {
    OctetArray = 0,
    Unsigned8 = 1,
    Unsigned16 = 2,
    Unsigned32 = 3,
    Unsigned64 = 4,
    Signed8 = 5,
    Signed16 = 6,
    Signed32 = 7,
    Signed64 = 8,
    Float32 = 9,
    Float64 = 10,
    Boolean = 11,
    MacAddress = 12,
    String = 13,
    DateTimeSeconds = 14,
    DateTimeMilliseconds = 15,
    DateTimeMicroseconds = 16,
    DateTimeNanoseconds = 17,
    Ipv4Address = 18,
    Ipv6Address = 19,
    BasicList = 20,
    SubTemplateList = 21,
    SubTemplateMultiList = 22,
}

impl DataType {
    /// Parse a data type from its numeric code.
    pub fn from_code(code: u8) -> Option<Self> {
        use DataType::*;
        Some(match code {
            0 => OctetArray,
            1 => Unsigned8,
            2 => Unsigned16,
            3 => Unsigned32,
            4 => Unsigned64,
            5 => Signed8,
            6 => Signed16,
            7 => Signed32,
            8 => Signed64,
            9 => Float32,
            10 => Float64,
            11 => Boolean,
            12 => MacAddress,
            13 => String,
            14 => DateTimeSeconds,
            15 => DateTimeMilliseconds,
            16 => DateTimeMicroseconds,
            17 => DateTimeNanoseconds,
            18 => Ipv4Address,
            19 => Ipv6Address,
            20 => BasicList,
            21 => SubTemplateList,
            22 => SubTemplateMultiList,
            _ => return None,
        })
    }

    /// Numeric code of this data type.
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Natural encoded length of the type.
    pub fn default_len(self) -> u16 {
        use DataType::*;
        match self {
            Unsigned8 | Signed8 | Boolean => 1,
            Unsigned16 | Signed16 => 2,
            Unsigned32 | Signed32 | Float32 | DateTimeSeconds | Ipv4Address => 4,
            Unsigned64 | Signed64 | Float64 | DateTimeMilliseconds | DateTimeMicroseconds
            | DateTimeNanoseconds => 8,
            MacAddress => 6,
            Ipv6Address => 16,
            OctetArray | String | BasicList | SubTemplateList | SubTemplateMultiList => VARLEN,
        }
    }

    /// Whether values of this type are byte-order dependent numbers.
    pub fn is_endian(self) -> bool {
        use DataType::*;
        matches!(
            self,
            Unsigned8
                | Unsigned16
                | Unsigned32
                | Unsigned64
                | Signed8
                | Signed16
                | Signed32
                | Signed64
                | Float32
                | Float64
                | Boolean
                | DateTimeSeconds
                | DateTimeMilliseconds
                | DateTimeMicroseconds
                | DateTimeNanoseconds
                | Ipv4Address
        )
    }

    pub fn is_signed(self) -> bool {
        matches!(
            self,
            DataType::Signed8 | DataType::Signed16 | DataType::Signed32 | DataType::Signed64
        )
    }

    pub fn is_float(self) -> bool {
        matches!(self, DataType::Float32 | DataType::Float64)
    }

    /// Whether the type is one of the RFC 6313 structured types.
    pub fn is_list(self) -> bool {
        matches!(
            self,
            DataType::BasicList | DataType::SubTemplateList | DataType::SubTemplateMultiList
        )
    }

    /// Whether a field of this type may use `len` (reduced-length rules).
    pub fn accepts_len(self, len: u16) -> bool {
        use DataType::*;
        if len == 0 {
            return false;
        }
        match self {
            OctetArray | String => true,
            BasicList | SubTemplateList | SubTemplateMultiList => len == VARLEN,
            Unsigned8 | Unsigned16 | Unsigned32 | Unsigned64 | Signed8 | Signed16 | Signed32
            | Signed64 => len <= self.default_len(),
            Float64 => len == 4 || len == 8,
            _ => len == self.default_len(),
        }
    }
}

/// Element semantics (RFC 5610 `informationElementSemantics`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[repr(u8)]
pub enum Semantics {
    #[default]
    Default = 0,
    Quantity = 1,
    TotalCounter = 2,
    DeltaCounter = 3,
    Identifier = 4,
    Flags = 5,
    List = 6,
    SnmpCounter = 7,
    SnmpGauge = 8,
}

impl Semantics {
    /// Parse semantics from the numeric code; unknown codes map to `Default`.
    pub fn from_code(code: u8) -> Self {
        match code {
            1 => Self::Quantity,
            2 => Self::TotalCounter,
            3 => Self::DeltaCounter,
            4 => Self::Identifier,
            5 => Self::Flags,
            6 => Self::List,
            7 => Self::SnmpCounter,
            8 => Self::SnmpGauge,
            _ => Self::Default,
        }
    }
}

/// Element units (RFC 5610 `informationElementUnits`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[repr(u16)]
pub enum Units {
    #[default]
    None = 0,
    Bits = 1,
    Octets = 2,
    Packets = 3,
    Flows = 4,
    Seconds = 5,
    Milliseconds = 6,
    Microseconds = 7,
    Nanoseconds = 8,
    FourOctetWords = 9,
    Messages = 10,
    Hops = 11,
    Entries = 12,
    Frames = 13,
    Ports = 14,
    Inferred = 15,
}

impl Units {
    /// Parse units from the numeric code; unknown codes map to `None`.
    pub fn from_code(code: u16) -> Self {
        match code {
            1 => Self::Bits,
            2 => Self::Octets,
            3 => Self::Packets,
            4 => Self::Flows,
            5 => Self::Seconds,
            6 => Self::Milliseconds,
            7 => Self::Microseconds,
            8 => Self::Nanoseconds,
            9 => Self::FourOctetWords,
            10 => Self::Messages,
            11 => Self::Hops,
            12 => Self::Entries,
            13 => Self::Frames,
            14 => Self::Ports,
            15 => Self::Inferred,
            _ => Self::None,
        }
    }
}

/// A single information element definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InfoElement {
    /// Element name (e.g., "sourceIPv4Address").
    pub name: String,
    /// Private enterprise number, 0 for IANA elements.
    #[serde(default)]
    pub pen: u32,
    /// Element id within the enterprise (high bit clear).
    pub id: u16,
    /// Default length, or [`VARLEN`].
    pub len: u16,
    /// Abstract data type.
    pub data_type: DataType,
    #[serde(default)]
    pub semantics: Semantics,
    #[serde(default)]
    pub units: Units,
    /// Lower bound of the value range (0 when unspecified).
    #[serde(default)]
    pub min: u64,
    /// Upper bound of the value range (0 when unspecified).
    #[serde(default)]
    pub max: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Register the RFC 5103 reverse counterpart alongside this element.
    #[serde(default)]
    pub reversible: bool,
    /// Placeholder synthesized for an element unknown to the model.
    #[serde(skip)]
    pub alien: bool,
}

impl InfoElement {
    /// Create an element with the data type's natural length.
    pub fn new(name: impl Into<String>, pen: u32, id: u16, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            pen,
            id: id & 0x7FFF,
            len: data_type.default_len(),
            data_type,
            semantics: Semantics::Default,
            units: Units::None,
            min: 0,
            max: 0,
            description: None,
            reversible: false,
            alien: false,
        }
    }

    pub fn with_len(mut self, len: u16) -> Self {
        self.len = len;
        self
    }

    pub fn with_semantics(mut self, semantics: Semantics) -> Self {
        self.semantics = semantics;
        self
    }

    pub fn with_units(mut self, units: Units) -> Self {
        self.units = units;
        self
    }

    pub fn with_range(mut self, min: u64, max: u64) -> Self {
        self.min = min;
        self.max = max;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Mark the element as reversible.
    pub fn reversible(mut self) -> Self {
        self.reversible = true;
        self
    }

    /// `(pen, id)` identity of the element.
    pub fn ident(&self) -> (u32, u16) {
        (self.pen, self.id)
    }

    pub fn is_varlen(&self) -> bool {
        self.len == VARLEN
    }

    /// Whether this element and `other` denote the same `(pen, id)`.
    pub fn same_ident(&self, other: &InfoElement) -> bool {
        self.ident() == other.ident()
    }

    /// Build the RFC 5103 reverse counterpart of this element.
    pub fn reverse(&self) -> Option<InfoElement> {
        if !self.reversible {
            return None;
        }

        let (pen, id) = if self.pen == IANA_PEN {
            (REVERSE_PEN, self.id)
        } else if self.id & REVERSE_ID_BIT == 0 {
            (self.pen, self.id | REVERSE_ID_BIT)
        } else {
            return None;
        };

        let mut name = String::with_capacity(self.name.len() + 7);
        name.push_str("reverse");
        let mut chars = self.name.chars();
        if let Some(first) = chars.next() {
            name.extend(first.to_uppercase());
            name.push_str(chars.as_str());
        }

        Some(InfoElement {
            name,
            pen,
            id,
            reversible: false,
            ..self.clone()
        })
    }
}

#[derive(Debug, Default)]
struct ModelInner {
    elements: Vec<Arc<InfoElement>>,
    by_id: HashMap<(u32, u16), Arc<InfoElement>>,
    by_name: HashMap<String, Arc<InfoElement>>,
}

impl ModelInner {
    fn insert(&mut self, ie: InfoElement) -> Arc<InfoElement> {
        if let Some(existing) = self.by_id.get(&ie.ident()) {
            return existing.clone();
        }

        let reverse = ie.reverse();
        let ie = Arc::new(ie);
        self.elements.push(ie.clone());
        self.by_id.insert(ie.ident(), ie.clone());
        if !ie.alien {
            self.by_name.entry(ie.name.clone()).or_insert_with(|| ie.clone());
        }

        if let Some(rev) = reverse {
            self.insert(rev);
        }

        ie
    }
}

/// A file of element definitions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElementDefinitions {
    /// Source of the definitions (e.g., "IANA", "CERT").
    #[serde(default)]
    pub source: Option<String>,
    pub elements: Vec<InfoElement>,
}

/// Append-only information element registry.
#[derive(Debug, Default)]
pub struct InfoModel {
    inner: RwLock<ModelInner>,
}

impl InfoModel {
    /// Create an empty model.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a model holding the built-in IANA and CERT elements.
    pub fn with_defaults() -> Self {
        let model = Self::new();
        model.add_elements(builtin_elements());
        model
    }

    /// Add an element (and its reverse, if reversible).
    ///
    /// Returns the registered element; an existing definition with the same
    /// `(pen, id)` is kept and returned unchanged.
    pub fn add_element(&self, ie: InfoElement) -> Arc<InfoElement> {
        self.inner.write().insert(ie)
    }

    /// Add several elements.
    pub fn add_elements(&self, elements: impl IntoIterator<Item = InfoElement>) {
        let mut inner = self.inner.write();
        for ie in elements {
            inner.insert(ie);
        }
    }

    /// Synthesize a placeholder for an element missing from the model.
    pub fn add_alien_element(&self, pen: u32, id: u16, len: u16) -> Arc<InfoElement> {
        let id = id & 0x7FFF;
        let mut inner = self.inner.write();
        if let Some(existing) = inner.by_id.get(&(pen, id)) {
            return existing.clone();
        }

        tracing::debug!(pen, id, len, "Synthesizing alien information element");

        let name = format!("_alien_{}_{}", pen, id);
        let mut ie = InfoElement::new(name, pen, id, DataType::OctetArray).with_len(len);
        ie.alien = true;
        inner.insert(ie)
    }

    pub fn lookup_by_name(&self, name: &str) -> Option<Arc<InfoElement>> {
        self.inner.read().by_name.get(name).cloned()
    }

    pub fn lookup_by_id(&self, pen: u32, id: u16) -> Option<Arc<InfoElement>> {
        self.inner.read().by_id.get(&(pen, id & 0x7FFF)).cloned()
    }

    /// Non-alien elements of one enterprise, in registration order.
    pub fn elements_with_pen(&self, pen: u32) -> Vec<Arc<InfoElement>> {
        self.inner
            .read()
            .elements
            .iter()
            .filter(|ie| ie.pen == pen && !ie.alien)
            .cloned()
            .collect()
    }

    /// Total number of registered elements, reverse and alien included.
    pub fn len(&self) -> usize {
        self.inner.read().elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Load element definitions from a JSON or JSON5 string.
    ///
    /// Returns the number of definitions read.
    pub fn load_json(&self, json: &str) -> Result<usize> {
        let defs: ElementDefinitions = serde_json::from_str(json)
            .or_else(|_| json5::from_str(json))
            .map_err(|e| Error::config(format!("Failed to parse element definitions: {}", e)))?;

        let count = defs.elements.len();
        self.add_elements(defs.elements);

        tracing::debug!(
            source = defs.source.as_deref().unwrap_or("unknown"),
            count,
            "Loaded information elements"
        );

        Ok(count)
    }

    /// Load element definitions from a JSON or JSON5 file.
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<usize> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::config(format!(
                "Failed to read element file '{}': {}",
                path.display(),
                e
            ))
        })?;

        self.load_json(&content)
    }
}
