//! In-memory records and structured-data values.
//!
//! A [`Record`] is laid out by its (internal) template: fixed-width fields
//! live in host byte order inside a flat image of [`Template::memory_len`]
//! octets, and variable-length or structured fields are kept as
//! [`Varfield`]s keyed by their offset in that image.

use bytes::Bytes;
use std::collections::HashMap;
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::infomodel::{DataType, InfoElement, VARLEN};
use crate::template::{Template, TemplateField};

/// RFC 6313 list semantics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ListSemantic {
    NoneOf,
    ExactlyOneOf,
    OneOrMoreOf,
    AllOf,
    Ordered,
    #[default]
    Undefined,
}

impl ListSemantic {
    pub fn from_code(code: u8) -> Self {
        match code {
            0 => Self::NoneOf,
            1 => Self::ExactlyOneOf,
            2 => Self::OneOrMoreOf,
            3 => Self::AllOf,
            4 => Self::Ordered,
            _ => Self::Undefined,
        }
    }

    pub fn code(self) -> u8 {
        match self {
            Self::NoneOf => 0,
            Self::ExactlyOneOf => 1,
            Self::OneOrMoreOf => 2,
            Self::AllOf => 3,
            Self::Ordered => 4,
            Self::Undefined => 0xFF,
        }
    }
}

/// A decoded or to-be-encoded field value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value<'a> {
    /// Unsigned integers and dateTime values.
    Unsigned(u64),
    Signed(i64),
    Float(f64),
    Boolean(bool),
    Ipv4(Ipv4Addr),
    Ipv6(Ipv6Addr),
    Mac([u8; 6]),
    Octets(&'a [u8]),
    String(&'a str),
    /// A structured-data field.
    List(&'a Varfield),
}

impl<'a> Value<'a> {
    pub fn as_u64(&self) -> Option<u64> {
        match *self {
            Value::Unsigned(v) => Some(v),
            Value::Signed(v) => u64::try_from(v).ok(),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            Value::Signed(v) => Some(v),
            Value::Unsigned(v) => i64::try_from(v).ok(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            Value::Float(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&'a [u8]> {
        match *self {
            Value::Octets(b) => Some(b),
            Value::String(s) => Some(s.as_bytes()),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&'a str> {
        match *self {
            Value::String(s) => Some(s),
            Value::Octets(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }
}

// --- Fixed-width value codecs ---

pub(crate) const NATIVE_BIG_ENDIAN: bool = cfg!(target_endian = "big");

fn read_uint(bytes: &[u8], big_endian: bool) -> u64 {
    let fold = |acc: u64, b: &u8| (acc << 8) | u64::from(*b);
    if big_endian {
        bytes.iter().fold(0, fold)
    } else {
        bytes.iter().rev().fold(0, fold)
    }
}

fn write_uint(out: &mut [u8], v: u64, big_endian: bool) {
    let len = out.len();
    for (i, b) in out.iter_mut().enumerate() {
        let shift = if big_endian { 8 * (len - 1 - i) } else { 8 * i };
        *b = if shift < 64 { (v >> shift) as u8 } else { 0 };
    }
}

fn sign_extend(v: u64, len: usize) -> i64 {
    let shift = 64 - 8 * len.clamp(1, 8) as u32;
    ((v << shift) as i64) >> shift
}

/// Numeric view of an endian-sensitive field.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum Number {
    Unsigned(u64),
    Signed(i64),
    Float(f64),
}

pub(crate) fn read_number(data_type: DataType, bytes: &[u8], big_endian: bool) -> Number {
    if data_type.is_float() {
        let raw = read_uint(bytes, big_endian);
        return match bytes.len() {
            4 => Number::Float(f64::from(f32::from_bits(raw as u32))),
            _ => Number::Float(f64::from_bits(raw)),
        };
    }

    let raw = read_uint(bytes, big_endian);
    if data_type.is_signed() {
        Number::Signed(sign_extend(raw, bytes.len()))
    } else {
        Number::Unsigned(raw)
    }
}

/// Store `n` into `out`; wider values keep their least-significant octets.
pub(crate) fn write_number(n: Number, out: &mut [u8], big_endian: bool) {
    let raw = match n {
        Number::Unsigned(v) => v,
        Number::Signed(v) => v as u64,
        Number::Float(v) if out.len() == 4 => u64::from((v as f32).to_bits()),
        Number::Float(v) => v.to_bits(),
    };
    write_uint(out, raw, big_endian);
}

/// Convert a fixed field between two byte orders and lengths.
pub(crate) fn convert_fixed(
    data_type: DataType,
    src: &[u8],
    src_big_endian: bool,
    dst: &mut [u8],
    dst_big_endian: bool,
) {
    if data_type.is_endian() {
        write_number(read_number(data_type, src, src_big_endian), dst, dst_big_endian);
    } else {
        copy_left_aligned(src, dst);
    }
}

pub(crate) fn copy_left_aligned(src: &[u8], dst: &mut [u8]) {
    let n = src.len().min(dst.len());
    dst[..n].copy_from_slice(&src[..n]);
    dst[n..].fill(0);
}

fn load_fixed(data_type: DataType, bytes: &[u8]) -> Value<'_> {
    match data_type {
        DataType::Boolean => Value::Boolean(bytes.first() == Some(&1)),
        DataType::Ipv4Address => {
            Value::Ipv4(Ipv4Addr::from(read_uint(bytes, NATIVE_BIG_ENDIAN) as u32))
        }
        DataType::Ipv6Address => match <[u8; 16]>::try_from(bytes) {
            Ok(octets) => Value::Ipv6(Ipv6Addr::from(octets)),
            Err(_) => Value::Octets(bytes),
        },
        DataType::MacAddress => match <[u8; 6]>::try_from(bytes) {
            Ok(mac) => Value::Mac(mac),
            Err(_) => Value::Octets(bytes),
        },
        DataType::String => match std::str::from_utf8(bytes) {
            Ok(s) => Value::String(s),
            Err(_) => Value::Octets(bytes),
        },
        dt if dt.is_endian() => match read_number(dt, bytes, NATIVE_BIG_ENDIAN) {
            Number::Unsigned(v) => Value::Unsigned(v),
            Number::Signed(v) => Value::Signed(v),
            Number::Float(v) => Value::Float(v),
        },
        _ => Value::Octets(bytes),
    }
}

fn fits_unsigned(v: u64, len: usize) -> bool {
    len >= 8 || v >> (8 * len) == 0
}

fn fits_signed(v: i64, len: usize) -> bool {
    len >= 8 || sign_extend(v as u64, len) == v
}

fn store_fixed(element: &InfoElement, out: &mut [u8], value: &Value<'_>) -> Result<()> {
    let len = out.len();
    let mismatch = || {
        Error::invalid_value(format!(
            "{:?} does not fit {} ({:?}, {} octets)",
            value, element.name, element.data_type, len
        ))
    };

    match (element.data_type, *value) {
        (DataType::Boolean, Value::Boolean(b)) => out.fill(if b { 1 } else { 2 }),
        (DataType::Ipv4Address, Value::Ipv4(addr)) => {
            write_uint(out, u64::from(u32::from(addr)), NATIVE_BIG_ENDIAN)
        }
        (DataType::Ipv6Address, Value::Ipv6(addr)) => copy_left_aligned(&addr.octets(), out),
        (DataType::MacAddress, Value::Mac(mac)) => copy_left_aligned(&mac, out),
        (DataType::OctetArray | DataType::String, Value::Octets(_) | Value::String(_)) => {
            let bytes = value.as_bytes().unwrap_or_default();
            if bytes.len() > len {
                return Err(mismatch());
            }
            copy_left_aligned(bytes, out);
        }
        (dt, Value::Float(v)) if dt.is_float() => {
            write_number(Number::Float(v), out, NATIVE_BIG_ENDIAN)
        }
        (dt, Value::Signed(v)) if dt.is_signed() => {
            if !fits_signed(v, len) {
                return Err(mismatch());
            }
            write_number(Number::Signed(v), out, NATIVE_BIG_ENDIAN);
        }
        (dt, Value::Unsigned(v)) if dt.is_endian() && !dt.is_float() && !dt.is_signed() => {
            if dt == DataType::Boolean || dt == DataType::Ipv4Address || !fits_unsigned(v, len) {
                return Err(mismatch());
            }
            write_number(Number::Unsigned(v), out, NATIVE_BIG_ENDIAN);
        }
        _ => return Err(mismatch()),
    }

    Ok(())
}

// --- Structured data ---

/// Content of a variable-length or structured field.
#[derive(Debug, Clone, PartialEq)]
pub enum Varfield {
    Octets(Bytes),
    BasicList(BasicList),
    SubTemplateList(SubTemplateList),
    SubTemplateMultiList(SubTemplateMultiList),
}

impl Varfield {
    /// Empty value for a field of the given type.
    pub fn empty(data_type: DataType) -> Self {
        match data_type {
            DataType::BasicList => Varfield::BasicList(BasicList::default()),
            DataType::SubTemplateList => Varfield::SubTemplateList(SubTemplateList::default()),
            DataType::SubTemplateMultiList => {
                Varfield::SubTemplateMultiList(SubTemplateMultiList::default())
            }
            _ => Varfield::Octets(Bytes::new()),
        }
    }

    fn fits(&self, data_type: DataType) -> bool {
        match self {
            Varfield::Octets(_) => !data_type.is_list(),
            Varfield::BasicList(_) => data_type == DataType::BasicList,
            Varfield::SubTemplateList(_) => data_type == DataType::SubTemplateList,
            Varfield::SubTemplateMultiList(_) => data_type == DataType::SubTemplateMultiList,
        }
    }

    fn value(&self, data_type: DataType) -> Value<'_> {
        match self {
            Varfield::Octets(bytes) if data_type == DataType::String => {
                match std::str::from_utf8(bytes) {
                    Ok(s) => Value::String(s),
                    Err(_) => Value::Octets(bytes),
                }
            }
            Varfield::Octets(bytes) => Value::Octets(bytes),
            list => Value::List(list),
        }
    }
}

/// Items of a basicList.
#[derive(Debug, Clone, PartialEq)]
pub enum ListItems {
    /// Fixed-width items, each `item_len` octets in host byte order.
    Fixed(Vec<u8>),
    /// Variable-length or structured items.
    Variable(Vec<Varfield>),
}

/// RFC 6313 basicList: repeated values of one element.
#[derive(Debug, Clone, PartialEq)]
pub struct BasicList {
    pub semantic: ListSemantic,
    /// Element of every item; `None` for an empty, untyped list.
    pub element: Option<Arc<InfoElement>>,
    /// Item length, or [`VARLEN`].
    pub item_len: u16,
    pub items: ListItems,
}

impl Default for BasicList {
    fn default() -> Self {
        Self {
            semantic: ListSemantic::Undefined,
            element: None,
            item_len: 0,
            items: ListItems::Fixed(Vec::new()),
        }
    }
}

impl BasicList {
    /// Empty list of `element` items at the element's default length.
    pub fn new(element: Arc<InfoElement>, semantic: ListSemantic) -> Self {
        let len = element.len;
        Self::with_item_len(element, len, semantic)
    }

    /// Empty list of `element` items at a reduced length.
    pub fn with_item_len(element: Arc<InfoElement>, item_len: u16, semantic: ListSemantic) -> Self {
        let variable = item_len == VARLEN || element.data_type.is_list();
        Self {
            semantic,
            item_len: if variable { VARLEN } else { item_len },
            element: Some(element),
            items: if variable {
                ListItems::Variable(Vec::new())
            } else {
                ListItems::Fixed(Vec::new())
            },
        }
    }

    pub fn len(&self) -> usize {
        match &self.items {
            ListItems::Fixed(bytes) if self.item_len > 0 && self.item_len != VARLEN => {
                bytes.len() / usize::from(self.item_len)
            }
            ListItems::Fixed(_) => 0,
            ListItems::Variable(items) => items.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append an item.
    pub fn push(&mut self, value: Value<'_>) -> Result<()> {
        let element = self
            .element
            .clone()
            .ok_or_else(|| Error::invalid_value("basicList has no element"))?;

        match &mut self.items {
            ListItems::Fixed(bytes) => {
                let start = bytes.len();
                bytes.resize(start + usize::from(self.item_len), 0);
                if let Err(e) = store_fixed(&element, &mut bytes[start..], &value) {
                    bytes.truncate(start);
                    return Err(e);
                }
            }
            ListItems::Variable(items) => {
                let item = match value {
                    Value::List(list) if list.fits(element.data_type) => list.clone(),
                    Value::Octets(_) | Value::String(_) if !element.data_type.is_list() => {
                        let bytes = value.as_bytes().unwrap_or_default();
                        Varfield::Octets(Bytes::copy_from_slice(bytes))
                    }
                    other => {
                        return Err(Error::invalid_value(format!(
                            "{:?} does not fit basicList of {}",
                            other, element.name
                        )));
                    }
                };
                items.push(item);
            }
        }

        Ok(())
    }

    /// Item at `index`.
    pub fn get(&self, index: usize) -> Option<Value<'_>> {
        let element = self.element.as_ref()?;
        match &self.items {
            ListItems::Fixed(bytes) => {
                let len = usize::from(self.item_len);
                let start = index.checked_mul(len)?;
                let item = bytes.get(start..start + len)?;
                Some(load_fixed(element.data_type, item))
            }
            ListItems::Variable(items) => items.get(index).map(|v| v.value(element.data_type)),
        }
    }
}

/// RFC 6313 subTemplateList: records of one template.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubTemplateList {
    pub semantic: ListSemantic,
    /// External template id of the records (0 for an empty list).
    pub tid: u16,
    pub records: Vec<Record>,
}

impl SubTemplateList {
    pub fn new(tid: u16, semantic: ListSemantic) -> Self {
        Self {
            semantic,
            tid,
            records: Vec::new(),
        }
    }

    pub fn push(&mut self, record: Record) {
        self.records.push(record);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// One entry of a subTemplateMultiList.
#[derive(Debug, Clone, PartialEq)]
pub struct MultiListEntry {
    /// External template id of the entry's records.
    pub tid: u16,
    pub records: Vec<Record>,
}

/// RFC 6313 subTemplateMultiList: entries of records from several templates.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubTemplateMultiList {
    pub semantic: ListSemantic,
    pub entries: Vec<MultiListEntry>,
}

impl SubTemplateMultiList {
    pub fn new(semantic: ListSemantic) -> Self {
        Self {
            semantic,
            entries: Vec::new(),
        }
    }

    /// Start a new entry and return it for filling.
    pub fn push_entry(&mut self, tid: u16) -> &mut MultiListEntry {
        self.entries.push(MultiListEntry {
            tid,
            records: Vec::new(),
        });
        let last = self.entries.len() - 1;
        &mut self.entries[last]
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// --- Records ---

/// A record laid out by its template.
#[derive(Clone)]
pub struct Record {
    template: Arc<Template>,
    data: Vec<u8>,
    vars: HashMap<u16, Varfield>,
}

impl fmt::Debug for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("Record");
        s.field("template", &self.template.serial());
        for field in self.template.fields() {
            s.field(field.name(), &self.field_value(field));
        }
        s.finish()
    }
}

impl PartialEq for Record {
    fn eq(&self, other: &Self) -> bool {
        (Arc::ptr_eq(&self.template, &other.template)
            || self.template.serial() == other.template.serial())
            && self.data == other.data
            && self.vars == other.vars
    }
}

impl Record {
    /// Zeroed record for `template`; variable fields start empty.
    pub fn new(template: Arc<Template>) -> Self {
        let vars = template
            .fields()
            .iter()
            .filter(|f| f.has_descriptor())
            .map(|f| (f.offset(), Varfield::empty(f.data_type())))
            .collect();

        Self {
            data: vec![0; usize::from(template.memory_len())],
            template,
            vars,
        }
    }

    pub fn template(&self) -> &Arc<Template> {
        &self.template
    }

    /// The fixed-width record image.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub(crate) fn fixed_mut(&mut self, field: &TemplateField) -> &mut [u8] {
        let start = usize::from(field.offset());
        &mut self.data[start..start + usize::from(field.len())]
    }

    pub(crate) fn fixed(&self, field: &TemplateField) -> &[u8] {
        let start = usize::from(field.offset());
        &self.data[start..start + usize::from(field.len())]
    }

    pub(crate) fn put_varfield(&mut self, field: &TemplateField, value: Varfield) {
        self.vars.insert(field.offset(), value);
    }

    pub(crate) fn field_varfield(&self, field: &TemplateField) -> Option<&Varfield> {
        self.vars.get(&field.offset())
    }

    fn field_value(&self, field: &TemplateField) -> Option<Value<'_>> {
        if field.has_descriptor() {
            self.field_varfield(field).map(|v| v.value(field.data_type()))
        } else {
            Some(load_fixed(field.data_type(), self.fixed(field)))
        }
    }

    fn field_at(&self, pos: usize) -> Result<TemplateField> {
        self.template
            .field(pos)
            .cloned()
            .ok_or_else(|| Error::invalid_value(format!("no field at position {}", pos)))
    }

    /// Position of the first field named `name`.
    pub fn position(&self, name: &str) -> Option<usize> {
        self.template.find_by_name(name, 0, 0).map(|(pos, _)| pos)
    }

    /// Value of the field at `pos`.
    pub fn get(&self, pos: usize) -> Option<Value<'_>> {
        self.field_value(self.template.field(pos)?)
    }

    pub fn get_by_name(&self, name: &str) -> Option<Value<'_>> {
        self.get(self.position(name)?)
    }

    /// Store a scalar value into the field at `pos`.
    pub fn set(&mut self, pos: usize, value: Value<'_>) -> Result<()> {
        let field = self.field_at(pos)?;
        if !field.has_descriptor() {
            return store_fixed(field.element(), self.fixed_mut(&field), &value);
        }

        let varfield = match value {
            Value::List(list) => list.clone(),
            Value::Octets(_) | Value::String(_) => {
                Varfield::Octets(Bytes::copy_from_slice(value.as_bytes().unwrap_or_default()))
            }
            other => {
                return Err(Error::invalid_value(format!(
                    "{:?} does not fit variable-length field {}",
                    other,
                    field.name()
                )));
            }
        };
        self.set_varfield(pos, varfield)
    }

    pub fn set_by_name(&mut self, name: &str, value: Value<'_>) -> Result<()> {
        let pos = self
            .position(name)
            .ok_or_else(|| Error::invalid_value(format!("no field named {}", name)))?;
        self.set(pos, value)
    }

    /// Replace the content of a variable-length or structured field.
    pub fn set_varfield(&mut self, pos: usize, value: Varfield) -> Result<()> {
        let field = self.field_at(pos)?;
        if !field.has_descriptor() || !value.fits(field.data_type()) {
            return Err(Error::invalid_value(format!(
                "field {} cannot hold {:?}",
                field.name(),
                value
            )));
        }
        self.put_varfield(&field, value);
        Ok(())
    }

    pub fn varfield(&self, pos: usize) -> Option<&Varfield> {
        self.field_varfield(self.template.field(pos)?)
    }

    pub fn varfield_mut(&mut self, pos: usize) -> Option<&mut Varfield> {
        let offset = self.template.field(pos)?.offset();
        self.vars.get_mut(&offset)
    }

    pub fn basic_list(&self, pos: usize) -> Option<&BasicList> {
        match self.varfield(pos)? {
            Varfield::BasicList(list) => Some(list),
            _ => None,
        }
    }

    pub fn sub_template_list(&self, pos: usize) -> Option<&SubTemplateList> {
        match self.varfield(pos)? {
            Varfield::SubTemplateList(list) => Some(list),
            _ => None,
        }
    }

    pub fn sub_template_multi_list(&self, pos: usize) -> Option<&SubTemplateMultiList> {
        match self.varfield(pos)? {
            Varfield::SubTemplateMultiList(list) => Some(list),
            _ => None,
        }
    }
}
