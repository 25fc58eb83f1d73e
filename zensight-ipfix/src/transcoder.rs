//! Record transcoding between internal and external templates.
//!
//! A [`Plan`] maps every field of a destination template to the field of a
//! source template with the same `(pen, id, repeat index)`. Encoding uses a
//! plan from a record's internal template to an external template and writes
//! network-order wire data; decoding uses a plan from an external template to
//! an internal one and fills a [`Record`]. Destination fields without a
//! source are zero-filled (variable-length and list fields are left empty).
//!
//! Structured-data fields recurse with their templates passed explicitly, so
//! a [`Transcoder`] holds no per-call template state.

use bytes::Bytes;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::Arc;

use crate::error::{Error, Result, TemplateError};
use crate::infomodel::{DataType, VARLEN};
use crate::record::{
    BasicList, ListItems, ListSemantic, MultiListEntry, NATIVE_BIG_ENDIAN, Record,
    SubTemplateList, SubTemplateMultiList, Varfield, convert_fixed, copy_left_aligned,
};
use crate::session::{Session, TemplateTable};
use crate::template::{Template, TemplateField};

/// Field mapping from a source template to a destination template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan {
    entries: Vec<Option<usize>>,
}

impl Plan {
    /// Entry `i` is the position in `src` of `dst.field(i)`, if present.
    pub fn build(src: &Template, dst: &Template) -> Self {
        let entries = dst
            .fields()
            .iter()
            .map(|f| {
                let (pen, id) = f.ident();
                src.position_of(pen, id, f.midx())
            })
            .collect();
        Self { entries }
    }

    pub fn entries(&self) -> &[Option<usize>] {
        &self.entries
    }

    /// Source position of destination field `pos`.
    pub fn source_of(&self, pos: usize) -> Option<usize> {
        self.entries.get(pos).copied().flatten()
    }
}

/// LRU cache of plans keyed by `(source serial, destination serial)`.
pub struct PlanCache {
    plans: LruCache<(u64, u64), Arc<Plan>>,
}

impl std::fmt::Debug for PlanCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlanCache")
            .field("len", &self.plans.len())
            .field("capacity", &self.plans.cap())
            .finish()
    }
}

impl PlanCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            plans: LruCache::new(NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN)),
        }
    }

    /// Cached plan from `src` to `dst`, built on a miss.
    pub fn get_or_build(&mut self, src: &Template, dst: &Template) -> Arc<Plan> {
        self.plans
            .get_or_insert((src.serial(), dst.serial()), || Arc::new(Plan::build(src, dst)))
            .clone()
    }

    /// Drop every plan involving the template with `serial`.
    ///
    /// Returns the number of plans removed.
    pub fn invalidate(&mut self, serial: u64) -> usize {
        let stale: Vec<(u64, u64)> = self
            .plans
            .iter()
            .filter(|((src, dst), _)| *src == serial || *dst == serial)
            .map(|(key, _)| *key)
            .collect();
        for key in &stale {
            self.plans.pop(key);
        }
        stale.len()
    }

    pub fn resize(&mut self, capacity: usize) {
        self.plans
            .resize(NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN));
    }

    pub fn clear(&mut self) {
        self.plans.clear();
    }

    pub fn len(&self) -> usize {
        self.plans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plans.is_empty()
    }
}

// --- Wire helpers ---

fn put_u16(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_be_bytes());
}

fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_be_bytes());
}

pub(crate) fn read_u16(input: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([input[at], input[at + 1]])
}

pub(crate) fn read_u32(input: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([input[at], input[at + 1], input[at + 2], input[at + 3]])
}

/// Write a variable-length value with its 1- or 3-octet length prefix.
fn write_varlen(out: &mut Vec<u8>, bytes: &[u8]) -> Result<()> {
    match u16::try_from(bytes.len()) {
        Ok(len) if len < 255 => out.push(len as u8),
        Ok(len) => {
            out.push(0xFF);
            put_u16(out, len);
        }
        Err(_) => {
            return Err(Error::invalid_value(format!(
                "variable-length value of {} octets exceeds 65535",
                bytes.len()
            )));
        }
    }
    out.extend_from_slice(bytes);
    Ok(())
}

/// Read a length prefix at `at`; returns the content span.
fn read_varlen(input: &[u8], at: usize, end: usize) -> Result<(usize, usize)> {
    if at >= end {
        return Err(Error::malformed("variable-length prefix past end of set"));
    }
    let (start, len) = if input[at] < 255 {
        (at + 1, usize::from(input[at]))
    } else {
        if at + 3 > end {
            return Err(Error::malformed("truncated variable-length prefix"));
        }
        (at + 3, usize::from(read_u16(input, at + 1)))
    };
    if start + len > end {
        return Err(Error::malformed(format!(
            "variable-length value of {} octets overruns its set",
            len
        )));
    }
    Ok((start, start + len))
}

/// Open a structured-data field; returns the position of its length.
fn begin_list(out: &mut Vec<u8>) -> usize {
    out.push(0xFF);
    let at = out.len();
    put_u16(out, 0);
    at
}

fn end_list(out: &mut [u8], at: usize) -> Result<()> {
    let len = u16::try_from(out.len() - at - 2)
        .map_err(|_| Error::invalid_value("structured-data field exceeds 65535 octets"))?;
    out[at..at + 2].copy_from_slice(&len.to_be_bytes());
    Ok(())
}

fn write_empty_list(out: &mut Vec<u8>) {
    out.extend_from_slice(&[0xFF, 0, 0]);
}

/// Deepest structured-data nesting accepted when decoding.
pub const MAX_LIST_DEPTH: usize = 32;

/// Stateless record transcoder over a session's template tables.
pub struct Transcoder<'a> {
    session: &'a Session,
    plans: &'a mut PlanCache,
    domain: u32,
    nested_as_external: bool,
    depth: usize,
}

impl<'a> Transcoder<'a> {
    /// Transcoder resolving nested templates in the session's current domain.
    pub fn new(session: &'a Session, plans: &'a mut PlanCache) -> Self {
        Self {
            domain: session.domain(),
            session,
            plans,
            nested_as_external: false,
            depth: 0,
        }
    }

    /// Resolve nested external templates in `domain` instead.
    pub fn in_domain(mut self, domain: u32) -> Self {
        self.domain = domain;
        self
    }

    /// Decode nested records with their external templates, ignoring pairs.
    pub fn nested_as_external(mut self) -> Self {
        self.nested_as_external = true;
        self
    }

    fn external(&self, tid: u16) -> Result<Arc<Template>> {
        self.session
            .external_in(self.domain, tid)
            .cloned()
            .ok_or_else(|| TemplateError::MissingExternal(tid).into())
    }

    // --- Encoding ---

    /// Append `record` encoded with `ext` to `out`.
    ///
    /// Fails with [`Error::EndOfMessage`] when `out` would grow past `limit`;
    /// `out` is left as it was on any failure.
    pub fn encode(
        &mut self,
        record: &Record,
        ext: &Template,
        out: &mut Vec<u8>,
        limit: usize,
    ) -> Result<()> {
        let start = out.len();
        match self.encode_fields(record, ext, out) {
            Ok(()) if out.len() <= limit => Ok(()),
            Ok(()) => {
                out.truncate(start);
                Err(Error::EndOfMessage)
            }
            Err(e) => {
                out.truncate(start);
                Err(e)
            }
        }
    }

    fn encode_fields(&mut self, record: &Record, ext: &Template, out: &mut Vec<u8>) -> Result<()> {
        let int = record.template();
        let plan = self.plans.get_or_build(int, ext);

        for (dst, src) in ext.fields().iter().zip(plan.entries()) {
            match src.and_then(|pos| int.field(pos)) {
                Some(src) => self.encode_field(record, src, dst, out)?,
                None if dst.data_type().is_list() => write_empty_list(out),
                None if dst.is_varlen() => out.push(0),
                None => out.resize(out.len() + usize::from(dst.len()), 0),
            }
        }
        Ok(())
    }

    fn encode_field(
        &mut self,
        record: &Record,
        src: &TemplateField,
        dst: &TemplateField,
        out: &mut Vec<u8>,
    ) -> Result<()> {
        if dst.data_type().is_list() {
            return match record.field_varfield(src) {
                Some(list) => self.encode_list(list, out),
                None => {
                    write_empty_list(out);
                    Ok(())
                }
            };
        }

        let octets: &[u8] = if src.has_descriptor() {
            match record.field_varfield(src) {
                Some(Varfield::Octets(bytes)) => bytes,
                _ => &[],
            }
        } else {
            record.fixed(src)
        };

        if dst.is_varlen() {
            return write_varlen(out, octets);
        }

        let start = out.len();
        out.resize(start + usize::from(dst.len()), 0);
        if src.has_descriptor() {
            copy_left_aligned(octets, &mut out[start..]);
        } else {
            convert_fixed(dst.data_type(), octets, NATIVE_BIG_ENDIAN, &mut out[start..], true);
        }
        Ok(())
    }

    fn encode_list(&mut self, list: &Varfield, out: &mut Vec<u8>) -> Result<()> {
        match list {
            Varfield::Octets(_) => write_empty_list(out),
            Varfield::BasicList(list) => self.encode_basic_list(list, out)?,
            Varfield::SubTemplateList(list) => {
                if list.tid == 0 && list.records.is_empty() {
                    write_empty_list(out);
                    return Ok(());
                }
                let at = begin_list(out);
                out.push(list.semantic.code());
                put_u16(out, list.tid);
                let ext = self.external(list.tid)?;
                for record in &list.records {
                    self.encode_fields(record, &ext, out)?;
                }
                end_list(out, at)?;
            }
            Varfield::SubTemplateMultiList(list) => {
                if list.entries.is_empty() {
                    write_empty_list(out);
                    return Ok(());
                }
                let at = begin_list(out);
                out.push(list.semantic.code());
                for entry in &list.entries {
                    let ext = self.external(entry.tid)?;
                    let entry_at = out.len();
                    put_u16(out, entry.tid);
                    put_u16(out, 0);
                    for record in &entry.records {
                        self.encode_fields(record, &ext, out)?;
                    }
                    let entry_len = u16::try_from(out.len() - entry_at).map_err(|_| {
                        Error::invalid_value("subTemplateMultiList entry exceeds 65535 octets")
                    })?;
                    out[entry_at + 2..entry_at + 4].copy_from_slice(&entry_len.to_be_bytes());
                }
                end_list(out, at)?;
            }
        }
        Ok(())
    }

    fn encode_basic_list(&mut self, list: &BasicList, out: &mut Vec<u8>) -> Result<()> {
        let Some(element) = &list.element else {
            write_empty_list(out);
            return Ok(());
        };

        let at = begin_list(out);
        out.push(list.semantic.code());
        if element.pen == 0 {
            put_u16(out, element.id);
        } else {
            put_u16(out, element.id | 0x8000);
        }
        put_u16(out, list.item_len);
        if element.pen != 0 {
            put_u32(out, element.pen);
        }

        match &list.items {
            ListItems::Fixed(bytes) => {
                let len = usize::from(list.item_len);
                if len == 0 || len == usize::from(VARLEN) {
                    return Err(Error::invalid_value(format!(
                        "basicList of {} has invalid item length {}",
                        element.name, list.item_len
                    )));
                }
                for item in bytes.chunks_exact(len) {
                    let start = out.len();
                    out.resize(start + len, 0);
                    let dst = &mut out[start..];
                    convert_fixed(element.data_type, item, NATIVE_BIG_ENDIAN, dst, true);
                }
            }
            ListItems::Variable(items) => {
                for item in items {
                    match item {
                        Varfield::Octets(bytes) => write_varlen(out, bytes)?,
                        nested => self.encode_list(nested, out)?,
                    }
                }
            }
        }

        end_list(out, at)
    }

    // --- Decoding ---

    /// Decode one record of `ext` starting at `start` into a record of `int`.
    ///
    /// Variable-length content aliases `input`. Returns the record and the
    /// number of octets consumed.
    pub fn decode(
        &mut self,
        ext: &Template,
        int: &Arc<Template>,
        input: &Bytes,
        start: usize,
        end: usize,
    ) -> Result<(Record, usize)> {
        let spans = field_spans(ext, input, start, end)?;
        let consumed = spans.last().map_or(start, |&(_, e)| e) - start;

        let plan = self.plans.get_or_build(ext, int);
        let mut record = Record::new(int.clone());
        for (dst, src) in int.fields().iter().zip(plan.entries()) {
            let Some(pos) = *src else {
                continue;
            };
            let (a, b) = spans[pos];
            self.decode_field(&mut record, &ext.fields()[pos], dst, input, a, b)?;
        }

        Ok((record, consumed))
    }

    fn decode_field(
        &mut self,
        record: &mut Record,
        src: &TemplateField,
        dst: &TemplateField,
        input: &Bytes,
        a: usize,
        b: usize,
    ) -> Result<()> {
        if dst.data_type().is_list() {
            let list = self.decode_list(dst.data_type(), input, a, b)?;
            record.put_varfield(dst, list);
        } else if dst.has_descriptor() {
            record.put_varfield(dst, Varfield::Octets(input.slice(a..b)));
        } else if src.is_varlen() {
            copy_left_aligned(&input[a..b], record.fixed_mut(dst));
        } else {
            convert_fixed(
                dst.data_type(),
                &input[a..b],
                true,
                record.fixed_mut(dst),
                NATIVE_BIG_ENDIAN,
            );
        }
        Ok(())
    }

    /// Decode one structured-data field, bounding the nesting depth.
    fn decode_list(
        &mut self,
        data_type: DataType,
        input: &Bytes,
        a: usize,
        b: usize,
    ) -> Result<Varfield> {
        if self.depth >= MAX_LIST_DEPTH {
            return Err(Error::malformed(format!(
                "structured data nested deeper than {} levels",
                MAX_LIST_DEPTH
            )));
        }
        self.depth += 1;
        let list = self.decode_list_contents(data_type, input, a, b);
        self.depth -= 1;
        list
    }

    fn decode_list_contents(
        &mut self,
        data_type: DataType,
        input: &Bytes,
        a: usize,
        b: usize,
    ) -> Result<Varfield> {
        if a == b {
            return Ok(Varfield::empty(data_type));
        }

        match data_type {
            DataType::BasicList => self.decode_basic_list(input, a, b).map(Varfield::BasicList),
            DataType::SubTemplateList => {
                if b - a < 3 {
                    return Err(Error::malformed("truncated subTemplateList header"));
                }
                let tid = read_u16(input, a + 1);
                Ok(Varfield::SubTemplateList(SubTemplateList {
                    semantic: ListSemantic::from_code(input[a]),
                    tid,
                    records: self.decode_records(tid, input, a + 3, b)?.unwrap_or_default(),
                }))
            }
            DataType::SubTemplateMultiList => {
                let mut list = SubTemplateMultiList::new(ListSemantic::from_code(input[a]));
                let mut at = a + 1;
                while at < b {
                    if b - at < 4 {
                        return Err(Error::malformed("truncated subTemplateMultiList entry header"));
                    }
                    let tid = read_u16(input, at);
                    let len = usize::from(read_u16(input, at + 2));
                    if len < 4 || at + len > b {
                        return Err(Error::malformed(format!(
                            "subTemplateMultiList entry length {} is invalid",
                            len
                        )));
                    }
                    if let Some(records) = self.decode_records(tid, input, at + 4, at + len)? {
                        list.entries.push(MultiListEntry { tid, records });
                    }
                    at += len;
                }
                Ok(Varfield::SubTemplateMultiList(list))
            }
            other => Err(Error::malformed(format!("{:?} is not a structured data type", other))),
        }
    }

    fn decode_basic_list(&mut self, input: &Bytes, a: usize, b: usize) -> Result<BasicList> {
        if b - a < 5 {
            return Err(Error::malformed("truncated basicList header"));
        }
        let semantic = ListSemantic::from_code(input[a]);
        let raw_id = read_u16(input, a + 1);
        let item_len = read_u16(input, a + 3);
        let mut at = a + 5;
        let mut pen = 0;
        if raw_id & 0x8000 != 0 {
            if b - at < 4 {
                return Err(Error::malformed("truncated basicList enterprise number"));
            }
            pen = read_u32(input, at);
            at += 4;
        }

        let id = raw_id & 0x7FFF;
        let model = self.session.model();
        let element = match model.lookup_by_id(pen, id) {
            Some(element) => element,
            None => {
                tracing::warn!(pen, id, "Unknown basicList element");
                model.add_alien_element(pen, id, item_len)
            }
        };

        let mut list = BasicList::with_item_len(element.clone(), item_len, semantic);
        match &mut list.items {
            ListItems::Variable(items) => {
                if item_len != VARLEN {
                    return Err(Error::malformed(format!(
                        "basicList of {} must use variable-length items",
                        element.name
                    )));
                }
                while at < b {
                    let (start, end) = read_varlen(input, at, b)?;
                    let item = if element.data_type.is_list() {
                        self.decode_list(element.data_type, input, start, end)?
                    } else {
                        Varfield::Octets(input.slice(start..end))
                    };
                    items.push(item);
                    at = end;
                }
            }
            ListItems::Fixed(bytes) => {
                let len = usize::from(item_len);
                if !element.data_type.accepts_len(item_len) || (b - at) % len != 0 {
                    return Err(Error::malformed(format!(
                        "basicList of {} has invalid item length {}",
                        element.name, item_len
                    )));
                }
                bytes.resize(b - at, 0);
                for (item, out) in input[at..b].chunks_exact(len).zip(bytes.chunks_exact_mut(len)) {
                    convert_fixed(element.data_type, item, true, out, NATIVE_BIG_ENDIAN);
                }
            }
        }

        Ok(list)
    }

    /// Decode the nested records of external template `tid` in `a..b`.
    ///
    /// Returns `None` when the records are skipped: missing template, or a
    /// pair disabling them.
    fn decode_records(
        &mut self,
        tid: u16,
        input: &Bytes,
        a: usize,
        b: usize,
    ) -> Result<Option<Vec<Record>>> {
        let Some(ext) = self.session.external_in(self.domain, tid).cloned() else {
            tracing::warn!(
                domain = self.domain,
                tid,
                "No template for nested records, skipping list content"
            );
            return Ok(None);
        };

        let int = if self.nested_as_external {
            ext.clone()
        } else {
            let int_tid = self.session.lookup_pair(tid);
            if int_tid == 0 {
                tracing::trace!(tid, "Nested records disabled by template pair");
                return Ok(None);
            }
            match self.session.template(TemplateTable::Internal, int_tid) {
                Some(int) => int.clone(),
                None => {
                    tracing::debug!(
                        tid,
                        int_tid,
                        "Paired template undefined, decoding as external"
                    );
                    ext.clone()
                }
            }
        };

        let min = usize::from(ext.wire_len()).max(1);
        let mut records = Vec::new();
        let mut at = a;
        while b - at >= min {
            let (record, consumed) = self.decode(&ext, &int, input, at, b)?;
            records.push(record);
            at += consumed.max(1);
        }
        Ok(Some(records))
    }
}

/// Octet span of every field of one `ext` record starting at `start`.
fn field_spans(
    ext: &Template,
    input: &[u8],
    start: usize,
    end: usize,
) -> Result<Vec<(usize, usize)>> {
    let mut spans = Vec::with_capacity(ext.len());
    let mut at = start;
    for field in ext.fields() {
        let span = if field.is_varlen() {
            read_varlen(input, at, end)?
        } else {
            let len = usize::from(field.len());
            if at + len > end {
                return Err(Error::malformed(format!(
                    "record truncated in field {}",
                    field.name()
                )));
            }
            (at, at + len)
        };
        spans.push(span);
        at = span.1;
    }
    Ok(spans)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infomodel::InfoModel;
    use crate::record::Value;
    use crate::template::ElementSpec;

    fn session() -> Session {
        Session::new(Arc::new(InfoModel::with_defaults()))
    }

    fn template(session: &Session, specs: &[(&'static str, u16)]) -> Arc<Template> {
        let specs: Vec<_> = specs.iter().map(|&(n, len)| ElementSpec::new(n, len, 0)).collect();
        Arc::new(Template::from_specs(session.model(), &specs).unwrap())
    }

    fn roundtrip(
        session: &Session,
        record: &Record,
        ext: &Arc<Template>,
        int: &Arc<Template>,
    ) -> (Vec<u8>, Record) {
        let mut plans = PlanCache::new(8);
        let mut transcoder = Transcoder::new(session, &mut plans);
        let mut out = Vec::new();
        transcoder.encode(record, ext, &mut out, usize::MAX).unwrap();

        let input = Bytes::from(out.clone());
        let (decoded, consumed) = transcoder.decode(ext, int, &input, 0, input.len()).unwrap();
        assert_eq!(consumed, out.len());
        (out, decoded)
    }

    #[test]
    fn test_plan_build() {
        let session = session();
        let src = template(&session, &[("sourceIPv4Address", 0), ("octetTotalCount", 0)]);
        let dst = template(
            &session,
            &[("octetTotalCount", 4), ("packetTotalCount", 0), ("sourceIPv4Address", 0)],
        );

        let plan = Plan::build(&src, &dst);
        assert_eq!(plan.entries(), &[Some(1), None, Some(0)]);
        assert_eq!(plan.source_of(1), None);
        assert_eq!(plan.source_of(9), None);
    }

    #[test]
    fn test_scalar_roundtrip() {
        let session = session();
        let t = template(
            &session,
            &[
                ("sourceIPv4Address", 0),
                ("sourceIPv6Address", 0),
                ("octetTotalCount", 0),
                ("mibObjectValueInteger", 0),
                ("interfaceName", 0),
                ("sourceMacAddress", 0),
                ("samplingProbability", 0),
            ],
        );

        let mut record = Record::new(t.clone());
        record.set(0, Value::Ipv4("192.0.2.1".parse().unwrap())).unwrap();
        record.set(1, Value::Ipv6("2001:db8::1".parse().unwrap())).unwrap();
        record.set(2, Value::Unsigned(1 << 40)).unwrap();
        record.set(3, Value::Signed(-123456)).unwrap();
        record.set(4, Value::String("ge-0/0/1")).unwrap();
        record.set(5, Value::Mac([0, 1, 2, 3, 4, 5])).unwrap();
        record.set(6, Value::Float(0.25)).unwrap();

        let (wire, decoded) = roundtrip(&session, &record, &t, &t);
        assert_eq!(&wire[..4], &[192, 0, 2, 1]);
        assert_eq!(wire.len(), 4 + 16 + 8 + 4 + 1 + 8 + 6 + 8);
        assert_eq!(decoded, record);
    }

    #[test]
    fn test_reduced_length_unsigned() {
        let session = session();
        let int = template(&session, &[("ingressInterface", 4)]);
        let ext = template(&session, &[("ingressInterface", 2)]);

        let mut record = Record::new(int.clone());
        record.set(0, Value::Unsigned(0x0001_2345)).unwrap();
        let (wire, decoded) = roundtrip(&session, &record, &ext, &int);
        assert_eq!(wire, vec![0x23, 0x45]);
        assert_eq!(decoded.get(0), Some(Value::Unsigned(0x2345)));

        // Narrow internal, wide external: zero extension.
        let narrow = template(&session, &[("ingressInterface", 2)]);
        let wide = template(&session, &[("ingressInterface", 4)]);
        let mut record = Record::new(narrow.clone());
        record.set(0, Value::Unsigned(0xFFFE)).unwrap();
        let (wire, decoded) = roundtrip(&session, &record, &wide, &narrow);
        assert_eq!(wire, vec![0, 0, 0xFF, 0xFE]);
        assert_eq!(decoded.get(0), Some(Value::Unsigned(0xFFFE)));
    }

    #[test]
    fn test_reduced_length_signed() {
        let session = session();
        let int = template(&session, &[("mibObjectValueInteger", 4)]);
        let ext = template(&session, &[("mibObjectValueInteger", 2)]);

        let mut record = Record::new(int.clone());
        record.set(0, Value::Signed(-2)).unwrap();
        let (wire, decoded) = roundtrip(&session, &record, &ext, &int);
        assert_eq!(wire, vec![0xFF, 0xFE]);
        assert_eq!(decoded.get(0), Some(Value::Signed(-2)));

        // Low 16 bits of 0x18001 are 0x8001, which sign-extends negative.
        record.set(0, Value::Signed(0x1_8001)).unwrap();
        let (_, decoded) = roundtrip(&session, &record, &ext, &int);
        assert_eq!(decoded.get(0), Some(Value::Signed(-0x7FFF)));

        let narrow = template(&session, &[("mibObjectValueInteger", 2)]);
        let wide = template(&session, &[("mibObjectValueInteger", 4)]);
        let mut record = Record::new(narrow.clone());
        record.set(0, Value::Signed(-2)).unwrap();
        let (wire, _) = roundtrip(&session, &record, &wide, &narrow);
        assert_eq!(wire, vec![0xFF, 0xFF, 0xFF, 0xFE]);
    }

    #[test]
    fn test_float_width_conversion() {
        let session = session();
        let int = template(&session, &[("samplingProbability", 8)]);
        let ext = template(&session, &[("samplingProbability", 4)]);

        let mut record = Record::new(int.clone());
        record.set(0, Value::Float(1.5)).unwrap();
        let (wire, decoded) = roundtrip(&session, &record, &ext, &int);
        assert_eq!(wire, 1.5f32.to_be_bytes().to_vec());
        assert_eq!(decoded.get(0), Some(Value::Float(1.5)));
    }

    #[test]
    fn test_long_varlen_prefix() {
        let session = session();
        let t = template(&session, &[("applicationDescription", 0)]);
        let text = "x".repeat(300);

        let mut record = Record::new(t.clone());
        record.set(0, Value::String(&text)).unwrap();
        let (wire, decoded) = roundtrip(&session, &record, &t, &t);
        assert_eq!(&wire[..3], &[0xFF, 0x01, 0x2C]);
        assert_eq!(wire.len(), 303);
        assert_eq!(decoded.get(0).and_then(|v| v.as_str()), Some(text.as_str()));
    }

    #[test]
    fn test_absent_fields() {
        let session = session();
        let int = template(&session, &[("sourceIPv4Address", 0)]);
        let ext = template(
            &session,
            &[("octetTotalCount", 0), ("sourceIPv4Address", 0), ("interfaceName", 0)],
        );

        let mut record = Record::new(int.clone());
        record.set(0, Value::Ipv4("10.1.2.3".parse().unwrap())).unwrap();
        let (wire, _) = roundtrip(&session, &record, &ext, &int);
        assert_eq!(wire, vec![0, 0, 0, 0, 0, 0, 0, 0, 10, 1, 2, 3, 0]);

        let input = Bytes::from(wire);
        let wide = template(&session, &[("sourceIPv4Address", 0), ("packetTotalCount", 0)]);
        let mut plans = PlanCache::new(4);
        let (decoded, _) = Transcoder::new(&session, &mut plans)
            .decode(&ext, &wide, &input, 0, input.len())
            .unwrap();
        assert_eq!(decoded.get(1), Some(Value::Unsigned(0)));
        assert_eq!(decoded.get(0), Some(Value::Ipv4("10.1.2.3".parse().unwrap())));
    }

    #[test]
    fn test_basic_list_roundtrip() {
        let session = session();
        let t = template(&session, &[("flowId", 0), ("basicList", 0)]);
        let port = session.model().lookup_by_name("destinationTransportPort").unwrap();

        let mut ports = BasicList::new(port, ListSemantic::AllOf);
        ports.push(Value::Unsigned(22)).unwrap();
        ports.push(Value::Unsigned(8443)).unwrap();

        let mut record = Record::new(t.clone());
        record.set(0, Value::Unsigned(7)).unwrap();
        record.set_varfield(1, Varfield::BasicList(ports)).unwrap();

        let (wire, decoded) = roundtrip(&session, &record, &t, &t);
        assert_eq!(
            &wire[8..],
            &[0xFF, 0, 9, 3, 0, 11, 0, 2, 0, 22, 0x20, 0xFB]
        );
        assert_eq!(decoded, record);
    }

    #[test]
    fn test_unknown_basic_list_element_becomes_alien() {
        let session = session();
        let t = template(&session, &[("basicList", 0)]);
        let wire = Bytes::from_static(&[
            0xFF, 0, 11, 4, 0x80, 7, 0, 2, 0, 0, 0x10, 0x92, 0xAA, 0xBB,
        ]);

        let mut plans = PlanCache::new(4);
        let (record, consumed) = Transcoder::new(&session, &mut plans)
            .decode(&t, &t, &wire, 0, wire.len())
            .unwrap();
        assert_eq!(consumed, wire.len());

        let list = record.basic_list(0).unwrap();
        let element = list.element.as_ref().unwrap();
        assert!(element.alien);
        assert_eq!(element.ident(), (4242, 7));
        assert_eq!(list.get(0), Some(Value::Octets(&[0xAA, 0xBB])));
    }

    #[test]
    fn test_nested_lists_roundtrip() {
        let mut session = session();
        let inner = template(&session, &[("sourceTransportPort", 0), ("basicList", 0)]);
        let outer = template(
            &session,
            &[("flowId", 0), ("subTemplateList", 0), ("subTemplateMultiList", 0)],
        );
        session.add_template(TemplateTable::External, 300, inner.clone(), None).unwrap();
        session.add_template(TemplateTable::Internal, 300, inner.clone(), None).unwrap();

        let name = session.model().lookup_by_name("interfaceName").unwrap();
        let mut names = BasicList::new(name, ListSemantic::Ordered);
        names.push(Value::String("eth0")).unwrap();
        names.push(Value::String("eth1")).unwrap();

        let mut child = Record::new(inner.clone());
        child.set(0, Value::Unsigned(53)).unwrap();
        child.set_varfield(1, Varfield::BasicList(names)).unwrap();

        let mut stl = SubTemplateList::new(300, ListSemantic::AllOf);
        stl.push(child.clone());
        stl.push(Record::new(inner.clone()));

        let mut stml = SubTemplateMultiList::new(ListSemantic::OneOrMoreOf);
        stml.push_entry(300).records.push(child);

        let mut record = Record::new(outer.clone());
        record.set(0, Value::Unsigned(99)).unwrap();
        record.set_varfield(1, Varfield::SubTemplateList(stl)).unwrap();
        record.set_varfield(2, Varfield::SubTemplateMultiList(stml)).unwrap();

        let (_, decoded) = roundtrip(&session, &record, &outer, &outer);
        assert_eq!(decoded, record);
        assert_eq!(decoded.sub_template_list(1).unwrap().len(), 2);
    }

    #[test]
    fn test_disabled_pair_skips_nested_records() {
        let mut session = session();
        let inner = template(&session, &[("sourceTransportPort", 0)]);
        let outer = template(&session, &[("subTemplateList", 0)]);
        session.add_template(TemplateTable::External, 300, inner.clone(), None).unwrap();

        let mut stl = SubTemplateList::new(300, ListSemantic::AllOf);
        let mut child = Record::new(inner.clone());
        child.set(0, Value::Unsigned(80)).unwrap();
        stl.push(child);
        let mut record = Record::new(outer.clone());
        record.set_varfield(0, Varfield::SubTemplateList(stl)).unwrap();

        session.add_pair(300, 0);
        let (_, decoded) = roundtrip(&session, &record, &outer, &outer);
        let list = decoded.sub_template_list(0).unwrap();
        assert_eq!(list.tid, 300);
        assert!(list.is_empty());
    }

    /// A basicList field holding `levels` basicLists of basicLists.
    fn nested_basic_lists(levels: usize) -> Bytes {
        let mut content = vec![3, 0x01, 0x23, 0xFF, 0xFF];
        for _ in 0..levels {
            let len = (content.len() as u16).to_be_bytes();
            let mut outer = vec![3, 0x01, 0x23, 0xFF, 0xFF, 0xFF, len[0], len[1]];
            outer.extend_from_slice(&content);
            content = outer;
        }
        let len = (content.len() as u16).to_be_bytes();
        let mut field = vec![0xFF, len[0], len[1]];
        field.extend_from_slice(&content);
        Bytes::from(field)
    }

    #[test]
    fn test_nesting_depth_is_bounded() {
        let session = session();
        let t = template(&session, &[("basicList", 0)]);
        let mut plans = PlanCache::new(4);

        let shallow = nested_basic_lists(10);
        let (record, consumed) = Transcoder::new(&session, &mut plans)
            .decode(&t, &t, &shallow, 0, shallow.len())
            .unwrap();
        assert_eq!(consumed, shallow.len());
        assert_eq!(record.basic_list(0).unwrap().len(), 1);

        let deep = nested_basic_lists(100);
        let err = Transcoder::new(&session, &mut plans)
            .decode(&t, &t, &deep, 0, deep.len())
            .unwrap_err();
        assert!(matches!(err, Error::Malformed(_)));
    }

    fn port_list(session: &Session, inner: &Arc<Template>, outer: &Arc<Template>) -> Record {
        let mut child = Record::new(inner.clone());
        child.set(0, Value::Unsigned(80)).unwrap();
        let mut stl = SubTemplateList::new(300, ListSemantic::AllOf);
        stl.push(child);
        let mut record = Record::new(outer.clone());
        record.set_varfield(0, Varfield::SubTemplateList(stl)).unwrap();
        assert!(session.external_in(session.domain(), 300).is_some());
        record
    }

    #[test]
    fn test_any_pair_skips_unpaired_nested_records() {
        let mut session = session();
        let inner = template(&session, &[("sourceTransportPort", 0)]);
        let outer = template(&session, &[("subTemplateList", 0)]);
        session.add_template(TemplateTable::External, 300, inner.clone(), None).unwrap();
        session.add_template(TemplateTable::Internal, 300, inner.clone(), None).unwrap();
        let record = port_list(&session, &inner, &outer);

        let (_, decoded) = roundtrip(&session, &record, &outer, &outer);
        assert_eq!(decoded.sub_template_list(0).unwrap().len(), 1);

        session.add_pair(301, 300);
        let (_, decoded) = roundtrip(&session, &record, &outer, &outer);
        let list = decoded.sub_template_list(0).unwrap();
        assert_eq!(list.tid, 300);
        assert!(list.is_empty());

        session.remove_pair(301);
        let (_, decoded) = roundtrip(&session, &record, &outer, &outer);
        assert_eq!(decoded.sub_template_list(0).unwrap().len(), 1);
    }

    #[test]
    fn test_pair_to_undefined_internal_decodes_as_external() {
        let mut session = session();
        let inner = template(&session, &[("sourceTransportPort", 0)]);
        let outer = template(&session, &[("subTemplateList", 0)]);
        session.add_template(TemplateTable::External, 300, inner.clone(), None).unwrap();
        session.add_pair(300, 400);
        let record = port_list(&session, &inner, &outer);

        let (_, decoded) = roundtrip(&session, &record, &outer, &outer);
        let list = decoded.sub_template_list(0).unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list.records[0].get(0), Some(Value::Unsigned(80)));
        assert!(Arc::ptr_eq(list.records[0].template(), &inner));
    }

    #[test]
    fn test_missing_external_for_encode() {
        let session = session();
        let inner = template(&session, &[("sourceTransportPort", 0)]);
        let outer = template(&session, &[("flowId", 0), ("subTemplateList", 0)]);

        let mut stl = SubTemplateList::new(300, ListSemantic::AllOf);
        stl.push(Record::new(inner));
        let mut record = Record::new(outer.clone());
        record.set_varfield(1, Varfield::SubTemplateList(stl)).unwrap();

        let mut plans = PlanCache::new(4);
        let mut out = vec![1, 2, 3];
        let err = Transcoder::new(&session, &mut plans)
            .encode(&record, &outer, &mut out, usize::MAX)
            .unwrap_err();
        assert!(matches!(err, Error::Template(TemplateError::MissingExternal(300))));
        assert_eq!(out, vec![1, 2, 3]);
    }

    #[test]
    fn test_encode_respects_limit() {
        let session = session();
        let t = template(&session, &[("octetTotalCount", 0)]);
        let record = Record::new(t.clone());

        let mut plans = PlanCache::new(4);
        let mut transcoder = Transcoder::new(&session, &mut plans);
        let mut out = vec![0; 10];
        let err = transcoder.encode(&record, &t, &mut out, 16).unwrap_err();
        assert!(matches!(err, Error::EndOfMessage));
        assert!(err.is_retryable());
        assert_eq!(out.len(), 10);
    }

    #[test]
    fn test_malformed_varlen() {
        let session = session();
        let t = template(&session, &[("interfaceName", 0)]);
        let input = Bytes::from_static(&[5, b'a', b'b']);

        let mut plans = PlanCache::new(4);
        let err = Transcoder::new(&session, &mut plans)
            .decode(&t, &t, &input, 0, input.len())
            .unwrap_err();
        assert!(matches!(err, Error::Malformed(_)));
    }

    #[test]
    fn test_plan_cache_invalidate() {
        let session = session();
        let a = template(&session, &[("sourceIPv4Address", 0)]);
        let b = template(&session, &[("sourceIPv4Address", 0)]);
        let c = template(&session, &[("sourceIPv4Address", 0)]);

        let mut cache = PlanCache::new(8);
        let first = cache.get_or_build(&a, &b);
        assert!(Arc::ptr_eq(&first, &cache.get_or_build(&a, &b)));
        cache.get_or_build(&b, &c);
        cache.get_or_build(&c, &a);
        assert_eq!(cache.len(), 3);

        assert_eq!(cache.invalidate(a.serial()), 2);
        assert_eq!(cache.len(), 1);

        cache.resize(1);
        cache.get_or_build(&a, &c);
        assert_eq!(cache.len(), 1);
    }
}
