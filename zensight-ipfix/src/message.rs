//! IPFIX message framing.
//!
//! A [`MessageBuffer`] owns a [`Session`] and either builds messages for an
//! [`Exporter`] or walks messages pulled from a [`Collector`] (or handed over
//! as raw bytes). Template sets are written and consumed here; data records
//! go through the [`Transcoder`].
//!
//! In automatic mode full messages are flushed and new ones read without
//! surfacing [`Error::EndOfMessage`]. In manual mode the caller sees
//! [`Error::EndOfMessage`] and [`Error::EndOfSet`] and drives framing itself.

use bytes::Bytes;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, trace, warn};

use crate::config::BufferOptions;
use crate::error::{Error, Result, TemplateError};
use crate::metadata::{self, MetadataKind, TemplateInfo, element_from_record, element_to_record};
use crate::record::Record;
use crate::session::{Attachment, Session, SessionEvent, TemplateTable};
use crate::template::Template;
use crate::transcoder::{PlanCache, Transcoder, read_u16, read_u32};
use crate::transport::{Collector, Exporter};

/// IPFIX protocol version.
pub const IPFIX_VERSION: u16 = 0x000A;

/// Length of the message header.
pub const MESSAGE_HEADER_LEN: usize = 16;

/// Length of a set header.
pub const SET_HEADER_LEN: usize = 4;

/// Set id of a Template Set.
pub const TEMPLATE_SET_ID: u16 = 2;

/// Set id of an Options Template Set.
pub const OPTIONS_TEMPLATE_SET_ID: u16 = 3;

/// Smallest set id carrying data records.
pub const MIN_DATA_SET_ID: u16 = 256;

/// Framing position of a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    /// No message is open.
    NoMessage,
    /// A message is open, no set is.
    MessageOpen,
    /// A set is open inside the current message.
    SetOpen { set_id: u16 },
}

enum Endpoint {
    Export(Box<dyn Exporter>),
    Collect(Box<dyn Collector>),
    /// Collection over caller-supplied bytes.
    External,
}

enum Pending {
    Session(SessionEvent),
    /// TemplateInfo record following an announced template.
    Info { domain: u32, info: TemplateInfo },
}

/// Builds or walks IPFIX messages for one session.
pub struct MessageBuffer {
    session: Session,
    options: BufferOptions,
    endpoint: Endpoint,
    plans: PlanCache,
    state: FrameState,

    internal: Option<(u16, Arc<Template>)>,
    external: Option<(u16, Arc<Template>)>,
    pending: VecDeque<Pending>,
    export_time: Option<u32>,

    // Export framing
    out: Vec<u8>,
    set_start: usize,
    message_domain: u32,
    message_records: u32,

    // Collection framing
    input: Bytes,
    message_start: usize,
    message_end: usize,
    cursor: usize,
    set_end: usize,
    set_template: Option<Arc<Template>>,
    received_export_time: u32,
    seen_domains: HashSet<u32>,
    special: HashMap<(u32, u16), MetadataKind>,
}

impl fmt::Debug for MessageBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mode = match self.endpoint {
            Endpoint::Export(_) => "export",
            Endpoint::Collect(_) => "collect",
            Endpoint::External => "external",
        };
        f.debug_struct("MessageBuffer")
            .field("mode", &mode)
            .field("state", &self.state)
            .field("domain", &self.session.domain())
            .field("internal", &self.internal.as_ref().map(|(tid, _)| *tid))
            .field("external", &self.external.as_ref().map(|(tid, _)| *tid))
            .finish()
    }
}

fn now() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u32::try_from(d.as_secs()).unwrap_or(u32::MAX))
        .unwrap_or(0)
}

fn put_u16(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_be_bytes());
}

fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_be_bytes());
}

impl MessageBuffer {
    fn with_endpoint(mut session: Session, endpoint: Endpoint, attachment: Attachment) -> Self {
        session.attach(attachment);
        let options = BufferOptions::default();
        Self {
            session,
            plans: PlanCache::new(options.plan_cache_size),
            options,
            endpoint,
            state: FrameState::NoMessage,
            internal: None,
            external: None,
            pending: VecDeque::new(),
            export_time: None,
            out: Vec::new(),
            set_start: 0,
            message_domain: 0,
            message_records: 0,
            input: Bytes::new(),
            message_start: 0,
            message_end: 0,
            cursor: 0,
            set_end: 0,
            set_template: None,
            received_export_time: 0,
            seen_domains: HashSet::new(),
            special: HashMap::new(),
        }
    }

    /// Buffer writing messages to `exporter`.
    ///
    /// External templates added to the session from now on are announced in
    /// the next message of their domain.
    pub fn for_export(session: Session, exporter: impl Exporter + 'static) -> Self {
        Self::with_endpoint(session, Endpoint::Export(Box::new(exporter)), Attachment::Export)
    }

    /// Buffer reading messages from `collector`.
    pub fn for_collection(session: Session, collector: impl Collector + 'static) -> Self {
        Self::with_endpoint(
            session,
            Endpoint::Collect(Box::new(collector)),
            Attachment::Collect,
        )
    }

    /// Buffer reading messages laid out back to back in `bytes`.
    ///
    /// When the bytes end inside a message, collection fails with
    /// [`Error::BufferTooSmall`]; supply more data with [`respan`](Self::respan).
    pub fn from_bytes(session: Session, bytes: impl Into<Bytes>) -> Self {
        let mut buffer = Self::with_endpoint(session, Endpoint::External, Attachment::Collect);
        buffer.input = bytes.into();
        buffer
    }

    /// Replace the options, resizing the plan cache.
    pub fn with_options(mut self, options: BufferOptions) -> Result<Self> {
        options.validate()?;
        self.plans.resize(options.plan_cache_size);
        self.options = options;
        Ok(self)
    }

    pub fn options(&self) -> &BufferOptions {
        &self.options
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut Session {
        &mut self.session
    }

    /// Detach and return the session. Unsent export data is discarded.
    pub fn into_session(self) -> Session {
        let mut session = self.session;
        session.detach();
        session
    }

    pub fn state(&self) -> FrameState {
        self.state
    }

    pub fn plan_cache(&self) -> &PlanCache {
        &self.plans
    }

    /// Export time of the open message: the received header value when
    /// collecting, the configured or current time when exporting.
    pub fn export_time(&self) -> u32 {
        match self.endpoint {
            Endpoint::Export(_) => self.export_time.unwrap_or_else(now),
            _ => self.received_export_time,
        }
    }

    /// Fix the export time written into new messages.
    pub fn set_export_time(&mut self, secs: u32) {
        self.export_time = Some(secs);
    }

    // --- Template selection ---

    /// Select the internal template used for collected records.
    pub fn set_internal_template(&mut self, tid: u16) -> Result<()> {
        let template = self
            .session
            .template(TemplateTable::Internal, tid)
            .cloned()
            .ok_or(TemplateError::MissingInternal(tid))?;
        self.internal = Some((tid, template));
        Ok(())
    }

    /// Select the external template, in the current domain, used for
    /// appended records.
    pub fn set_export_template(&mut self, tid: u16) -> Result<()> {
        let template = self
            .session
            .template(TemplateTable::External, tid)
            .cloned()
            .ok_or(TemplateError::MissingExternal(tid))?;
        self.external = Some((tid, template));
        Ok(())
    }

    pub fn internal_template(&self) -> Option<(u16, &Arc<Template>)> {
        self.internal.as_ref().map(|(tid, t)| (*tid, t))
    }

    pub fn export_template(&self) -> Option<(u16, &Arc<Template>)> {
        self.external.as_ref().map(|(tid, t)| (*tid, t))
    }

    // --- Session events ---

    fn process_events(&mut self) -> Result<()> {
        self.pending
            .extend(self.session.drain_events().into_iter().map(Pending::Session));

        while let Some(event) = self.pending.pop_front() {
            match event {
                Pending::Session(SessionEvent::Revoked { serial }) => self.revoke(serial),
                Pending::Session(SessionEvent::Announce {
                    domain,
                    tid,
                    template,
                    info,
                }) => {
                    if let Err(e) = self.write_template(domain, tid, &template) {
                        self.pending.push_front(Pending::Session(SessionEvent::Announce {
                            domain,
                            tid,
                            template,
                            info,
                        }));
                        return Err(e);
                    }
                    if let Some(info) = info.filter(|_| self.session.template_metadata_enabled()) {
                        self.pending.push_front(Pending::Info { domain, info });
                    }
                }
                Pending::Session(SessionEvent::Withdraw {
                    domain,
                    tid,
                    options,
                }) => {
                    if let Err(e) = self.write_withdrawal(domain, tid, options) {
                        self.pending.push_front(Pending::Session(SessionEvent::Withdraw {
                            domain,
                            tid,
                            options,
                        }));
                        return Err(e);
                    }
                }
                Pending::Info { domain, info } => {
                    if let Err(e) = self.write_template_info(domain, &info) {
                        self.pending.push_front(Pending::Info { domain, info });
                        return Err(e);
                    }
                }
            }
        }
        Ok(())
    }

    fn revoke(&mut self, serial: u64) {
        let removed = self.plans.invalidate(serial);
        trace!(serial, removed, "Invalidated transcoding plans");

        if self.internal.as_ref().is_some_and(|(_, t)| t.serial() == serial) {
            self.internal = self.internal.take().and_then(|(tid, _)| {
                let t = self.session.template(TemplateTable::Internal, tid)?.clone();
                Some((tid, t))
            });
        }
        if self.external.as_ref().is_some_and(|(_, t)| t.serial() == serial) {
            self.external = self.external.take().and_then(|(tid, _)| {
                let t = self.session.template(TemplateTable::External, tid)?.clone();
                Some((tid, t))
            });
        }
    }

    // --- Export framing ---

    fn require_export(&self) -> Result<()> {
        match self.endpoint {
            Endpoint::Export(_) => Ok(()),
            _ => Err(Error::setup("buffer is not open for export")),
        }
    }

    fn open_message(&mut self, domain: u32) -> Result<()> {
        if self.state != FrameState::NoMessage && self.message_domain != domain {
            self.flush()?;
        }
        if self.state != FrameState::NoMessage {
            return Ok(());
        }

        let export_time = self.export_time.unwrap_or_else(now);
        let sequence = self.session.sequence_of(domain);
        self.out.clear();
        put_u16(&mut self.out, IPFIX_VERSION);
        put_u16(&mut self.out, 0);
        put_u32(&mut self.out, export_time);
        put_u32(&mut self.out, sequence);
        put_u32(&mut self.out, domain);

        self.message_domain = domain;
        self.message_records = 0;
        self.state = FrameState::MessageOpen;
        trace!(domain, sequence, "Opened message");
        Ok(())
    }

    fn open_set(&mut self, set_id: u16) {
        if self.state == (FrameState::SetOpen { set_id }) {
            return;
        }
        self.close_set();
        self.set_start = self.out.len();
        put_u16(&mut self.out, set_id);
        put_u16(&mut self.out, 0);
        self.state = FrameState::SetOpen { set_id };
    }

    /// Close the open set; a set without content is dropped.
    fn close_set(&mut self) {
        if let FrameState::SetOpen { .. } = self.state {
            let len = self.out.len() - self.set_start;
            if len <= SET_HEADER_LEN {
                self.out.truncate(self.set_start);
            } else {
                // Bounded by max_message_len.
                let len = len as u16;
                let at = self.set_start + 2;
                self.out[at..at + 2].copy_from_slice(&len.to_be_bytes());
            }
            self.state = FrameState::MessageOpen;
        }
    }

    fn is_fresh(&self) -> bool {
        self.out.len() == MESSAGE_HEADER_LEN + SET_HEADER_LEN
    }

    /// Position a set of `set_id` in a message of `domain` with room for
    /// `len` more octets.
    fn reserve(&mut self, domain: u32, set_id: u16, len: usize) -> Result<()> {
        self.open_message(domain)?;
        self.open_set(set_id);
        if self.out.len() + len <= self.options.max_message_len {
            return Ok(());
        }

        let fresh = self.is_fresh();
        self.close_set();
        if fresh {
            return Err(Error::invalid_value(format!(
                "{} octets do not fit in a {} octet message",
                len, self.options.max_message_len
            )));
        }
        if !self.options.automatic {
            return Err(Error::EndOfMessage);
        }

        self.flush()?;
        self.open_message(domain)?;
        self.open_set(set_id);
        Ok(())
    }

    fn write_template(&mut self, domain: u32, tid: u16, template: &Template) -> Result<()> {
        let set_id = if template.is_options() {
            OPTIONS_TEMPLATE_SET_ID
        } else {
            TEMPLATE_SET_ID
        };
        self.reserve(domain, set_id, template.template_record_len())?;

        let out = &mut self.out;
        put_u16(out, tid);
        put_u16(out, template.len() as u16);
        if template.is_options() {
            put_u16(out, template.scope_count() as u16);
        }
        for field in template.fields() {
            let (pen, id) = field.ident();
            if pen == 0 {
                put_u16(out, id);
                put_u16(out, field.len());
            } else {
                put_u16(out, id | 0x8000);
                put_u16(out, field.len());
                put_u32(out, pen);
            }
        }

        debug!(domain, tid, fields = template.len(), "Exported template");
        Ok(())
    }

    fn write_withdrawal(&mut self, domain: u32, tid: u16, options: bool) -> Result<()> {
        let set_id = if options {
            OPTIONS_TEMPLATE_SET_ID
        } else {
            TEMPLATE_SET_ID
        };
        self.reserve(domain, set_id, 4)?;
        put_u16(&mut self.out, tid);
        put_u16(&mut self.out, 0);
        debug!(domain, tid, "Exported template withdrawal");
        Ok(())
    }

    fn write_template_info(&mut self, domain: u32, info: &TemplateInfo) -> Result<()> {
        let (Some((tid, template)), Some((list_tid, list_template))) = (
            self.session.metadata_template_in(domain, MetadataKind::TemplateInfo),
            self.session.metadata_template_in(domain, MetadataKind::BasicListInfo),
        ) else {
            return Ok(());
        };
        let record = info.to_record(&template, list_tid, &list_template)?;
        self.write_record(domain, tid, &template, &record)
    }

    fn write_record(
        &mut self,
        domain: u32,
        tid: u16,
        ext: &Template,
        record: &Record,
    ) -> Result<()> {
        self.open_message(domain)?;
        self.open_set(tid);

        let limit = self.options.max_message_len;
        let encoded = Transcoder::new(&self.session, &mut self.plans)
            .in_domain(domain)
            .encode(record, ext, &mut self.out, limit);
        match encoded {
            Ok(()) => {}
            Err(Error::EndOfMessage) => {
                let fresh = self.is_fresh();
                self.close_set();
                if fresh {
                    return Err(Error::invalid_value(format!(
                        "record does not fit in a {} octet message",
                        limit
                    )));
                }
                if !self.options.automatic {
                    return Err(Error::EndOfMessage);
                }

                self.flush()?;
                self.open_message(domain)?;
                self.open_set(tid);
                let retried = Transcoder::new(&self.session, &mut self.plans)
                    .in_domain(domain)
                    .encode(record, ext, &mut self.out, limit);
                if let Err(e) = retried {
                    self.close_set();
                    return Err(e);
                }
            }
            Err(e) => {
                if self.is_fresh() {
                    self.close_set();
                }
                return Err(e);
            }
        }

        self.message_records += 1;
        Ok(())
    }

    /// Append `record` encoded with the selected export template.
    ///
    /// The record's own template is the source of the transcoding. Pending
    /// template announcements are written first.
    pub fn append(&mut self, record: &Record) -> Result<()> {
        self.require_export()?;
        self.process_events()?;

        let (tid, ext) = self.external.clone().ok_or(TemplateError::NoExternal)?;
        let domain = self.session.domain();
        self.write_record(domain, tid, &ext, record)?;
        trace!(domain, tid, "Appended record");
        Ok(())
    }

    /// Write every external template of the current domain, followed by its
    /// TemplateInfo record when template metadata is enabled.
    pub fn export_templates(&mut self) -> Result<()> {
        self.require_export()?;
        self.process_events()?;

        let domain = self.session.domain();
        let mut ids = self.session.external_template_ids();
        // Metadata templates precede the TemplateInfo records that use them.
        ids.sort_by_key(|&tid| (!self.session.is_metadata_tid(domain, tid), tid));

        for tid in ids {
            let Some(template) = self.session.template(TemplateTable::External, tid).cloned() else {
                continue;
            };
            self.write_template(domain, tid, &template)?;

            if self.session.template_metadata_enabled()
                && let Some(info) = self.session.template_info(tid).cloned()
            {
                self.write_template_info(domain, &info)?;
            }
        }
        Ok(())
    }

    /// Write an RFC 5610 element-type record for every element of `pen`.
    ///
    /// Returns the number of records written.
    pub fn export_element_metadata(&mut self, pen: u32) -> Result<usize> {
        self.require_export()?;
        self.process_events()?;

        let domain = self.session.domain();
        let (tid, template) = self
            .session
            .metadata_template_in(domain, MetadataKind::ElementType)
            .ok_or_else(|| Error::setup("element metadata is not enabled on the session"))?;

        let elements = self.session.model().elements_with_pen(pen);
        for element in &elements {
            let record = element_to_record(element, &template)?;
            self.write_record(domain, tid, &template, &record)?;
        }

        debug!(domain, pen, count = elements.len(), "Exported element metadata");
        Ok(elements.len())
    }

    /// Write pending announcements and hand the open message to the exporter.
    ///
    /// Announcements that do not fit in the open message go out in the
    /// following ones, in manual mode too.
    pub fn emit(&mut self) -> Result<()> {
        self.require_export()?;
        loop {
            match self.process_events() {
                Ok(()) => break,
                Err(Error::EndOfMessage) => self.flush()?,
                Err(e) => return Err(e),
            }
        }
        self.flush()
    }

    fn flush(&mut self) -> Result<()> {
        if self.state == FrameState::NoMessage {
            return Ok(());
        }
        self.close_set();
        if self.out.len() <= MESSAGE_HEADER_LEN {
            self.out.clear();
            self.state = FrameState::NoMessage;
            return Ok(());
        }

        let len = self.out.len() as u16;
        self.out[2..4].copy_from_slice(&len.to_be_bytes());

        let Endpoint::Export(exporter) = &mut self.endpoint else {
            return Err(Error::setup("buffer is not open for export"));
        };
        exporter.write_message(&self.out)?;

        self.session
            .advance_sequence(self.message_domain, self.message_records);
        debug!(
            domain = self.message_domain,
            len,
            records = self.message_records,
            "Emitted message"
        );

        self.out.clear();
        self.message_records = 0;
        self.state = FrameState::NoMessage;
        Ok(())
    }

    // --- Collection framing ---

    fn require_collect(&self) -> Result<()> {
        match self.endpoint {
            Endpoint::Export(_) => Err(Error::setup("buffer is not open for collection")),
            _ => Ok(()),
        }
    }

    /// Replace the bytes of an external collection buffer.
    pub fn respan(&mut self, bytes: impl Into<Bytes>) -> Result<()> {
        if !matches!(self.endpoint, Endpoint::External) {
            return Err(Error::setup("only byte-backed buffers can be respanned"));
        }
        self.input = bytes.into();
        self.cursor = 0;
        self.message_start = 0;
        self.message_end = 0;
        self.set_end = 0;
        self.set_template = None;
        self.state = FrameState::NoMessage;
        Ok(())
    }

    /// Collected bytes not consumed yet, starting at the open message.
    pub fn unconsumed(&self) -> Bytes {
        let from = match self.state {
            FrameState::NoMessage => self.cursor,
            _ => self.message_start,
        };
        self.input.slice(from.min(self.input.len())..)
    }

    /// Advance to the next message, skipping what is left of the current one.
    pub fn next_message(&mut self) -> Result<()> {
        self.require_collect()?;

        if self.state != FrameState::NoMessage {
            self.cursor = self.message_end;
            self.state = FrameState::NoMessage;
        }

        if let Endpoint::Collect(collector) = &mut self.endpoint {
            let mut buf = Vec::new();
            let n = collector.read_message(&mut buf)?;
            if n == 0 {
                return Err(Error::EndOfStream);
            }
            buf.truncate(n);
            self.input = Bytes::from(buf);
            self.cursor = 0;
        }

        self.read_message_header()
    }

    fn read_message_header(&mut self) -> Result<()> {
        let external = matches!(self.endpoint, Endpoint::External);
        let start = self.cursor;
        let available = self.input.len().saturating_sub(start);

        if available < MESSAGE_HEADER_LEN {
            if external {
                return Err(Error::BufferTooSmall {
                    needed: MESSAGE_HEADER_LEN - available,
                });
            }
            return Err(Error::malformed("truncated message header"));
        }

        let version = read_u16(&self.input, start);
        let len = usize::from(read_u16(&self.input, start + 2));
        if version != IPFIX_VERSION || len < MESSAGE_HEADER_LEN {
            self.cursor = self.input.len();
            return Err(Error::malformed(format!(
                "bad message header (version {:#06x}, length {})",
                version, len
            )));
        }
        if len > available {
            if external {
                return Err(Error::BufferTooSmall {
                    needed: len - available,
                });
            }
            return Err(Error::malformed(format!(
                "message length {} exceeds the {} octets read",
                len, available
            )));
        }

        let export_time = read_u32(&self.input, start + 4);
        let sequence = read_u32(&self.input, start + 8);
        let domain = read_u32(&self.input, start + 12);

        self.session.set_domain(domain)?;
        let expected = self.session.sequence();
        if !self.seen_domains.insert(domain) && sequence != expected {
            warn!(
                domain,
                expected,
                received = sequence,
                "Sequence number mismatch"
            );
        }
        self.session.set_sequence(sequence);

        self.received_export_time = export_time;
        self.message_start = start;
        self.message_end = start + len;
        self.cursor = start + MESSAGE_HEADER_LEN;
        self.state = FrameState::MessageOpen;
        debug!(domain, sequence, len, "Read message");
        Ok(())
    }

    fn read_template_set(&mut self, set_id: u16, start: usize, end: usize) -> Result<()> {
        let options = set_id == OPTIONS_TEMPLATE_SET_ID;
        let domain = self.session.domain();
        let model = self.session.model().clone();
        let mut at = start;

        while end - at >= 4 {
            let tid = read_u16(&self.input, at);
            let count = read_u16(&self.input, at + 2);
            at += 4;

            if count == 0 {
                if tid == set_id {
                    let removed = self.session.remove_all_external(options);
                    debug!(domain, options, count = removed.len(), "Withdrawing all templates");
                    for tid in removed {
                        self.special.remove(&(domain, tid));
                    }
                } else {
                    debug!(domain, tid, "Withdrawing template");
                    if self.session.template(TemplateTable::External, tid).is_some() {
                        self.session.remove_template(TemplateTable::External, tid)?;
                    }
                    self.special.remove(&(domain, tid));
                }
                continue;
            }

            let mut scope = 0;
            if options {
                if end - at < 2 {
                    return Err(Error::malformed("truncated options template record"));
                }
                scope = read_u16(&self.input, at);
                at += 2;
            }

            let mut template = Template::new();
            let mut invalid: Option<Error> = None;
            for _ in 0..count {
                if end - at < 4 {
                    return Err(Error::malformed("truncated template record"));
                }
                let raw = read_u16(&self.input, at);
                let len = read_u16(&self.input, at + 2);
                at += 4;

                let mut pen = 0;
                if raw & 0x8000 != 0 {
                    if end - at < 4 {
                        return Err(Error::malformed("truncated enterprise number"));
                    }
                    pen = read_u32(&self.input, at);
                    at += 4;
                }
                if invalid.is_some() {
                    continue;
                }
                if len == 0 {
                    invalid = Some(Error::malformed("zero-length field"));
                    continue;
                }

                let id = raw & 0x7FFF;
                let element = model
                    .lookup_by_id(pen, id)
                    .unwrap_or_else(|| model.add_alien_element(pen, id, len));
                if let Err(e) = template.append(element, len) {
                    invalid = Some(e.into());
                }
            }
            if invalid.is_none()
                && scope > 0
                && let Err(e) = template.set_scope(usize::from(scope))
            {
                invalid = Some(e.into());
            }
            if let Some(error) = invalid {
                warn!(domain, tid, %error, "Ignoring invalid template record");
                continue;
            }

            if tid < MIN_DATA_SET_ID {
                warn!(domain, tid, "Ignoring template with reserved id");
                continue;
            }

            if let Some(existing) = self.session.template(TemplateTable::External, tid)
                && existing.compare_ordered(&template, Default::default())
            {
                trace!(domain, tid, "Template unchanged");
                continue;
            }

            let template = Arc::new(template);
            let kind = metadata::classify(&template).filter(|kind| match kind {
                MetadataKind::ElementType => self.options.auto_insert_elements,
                MetadataKind::TemplateInfo => self.options.auto_insert_template_info,
                MetadataKind::BasicListInfo => false,
            });

            debug!(domain, tid, fields = template.len(), "Received template");
            match (self.session.receive_template(tid, template)?, kind) {
                (true, Some(kind)) => {
                    self.special.insert((domain, tid), kind);
                }
                _ => {
                    self.special.remove(&(domain, tid));
                }
            }
        }
        Ok(())
    }

    fn consume_metadata(&mut self, kind: MetadataKind, ext: &Arc<Template>) -> Result<()> {
        let domain = self.session.domain();
        let decoded = Transcoder::new(&self.session, &mut self.plans)
            .nested_as_external()
            .decode(ext, ext, &self.input, self.cursor, self.set_end);
        let (record, consumed) = match decoded {
            Ok(decoded) => decoded,
            Err(e) => {
                self.skip_set();
                return Err(e);
            }
        };
        self.cursor += consumed;
        self.session.advance_sequence(domain, 1);

        match kind {
            MetadataKind::ElementType => match element_from_record(&record) {
                Some(element) => {
                    debug!(
                        domain,
                        name = %element.name,
                        pen = element.pen,
                        id = element.id,
                        "Learned information element"
                    );
                    self.session.model().add_element(element);
                }
                None => warn!(domain, "Ignoring unusable element type record"),
            },
            MetadataKind::TemplateInfo => {
                if let Some(info) = TemplateInfo::from_record(&record) {
                    let tid = info.tid;
                    if let Err(e) = self.session.set_template_info(tid, info) {
                        debug!(domain, tid, error = %e, "Ignoring template info");
                    }
                }
            }
            MetadataKind::BasicListInfo => {}
        }
        Ok(())
    }

    fn skip_set(&mut self) {
        self.cursor = self.set_end;
        self.set_template = None;
        self.state = FrameState::MessageOpen;
    }

    /// Move to the next user data record, consuming template and metadata
    /// sets on the way.
    fn position(&mut self) -> Result<(u16, Arc<Template>)> {
        loop {
            self.process_events()?;

            match self.state {
                FrameState::NoMessage => self.next_message()?,
                FrameState::MessageOpen => {
                    if self.message_end - self.cursor < SET_HEADER_LEN {
                        self.cursor = self.message_end;
                        self.state = FrameState::NoMessage;
                        if !self.options.automatic {
                            return Err(Error::EndOfMessage);
                        }
                        continue;
                    }

                    let set_id = read_u16(&self.input, self.cursor);
                    let len = usize::from(read_u16(&self.input, self.cursor + 2));
                    if len < SET_HEADER_LEN || self.cursor + len > self.message_end {
                        self.cursor = self.message_end;
                        return Err(Error::malformed(format!(
                            "set length {} overruns the message",
                            len
                        )));
                    }

                    let body = self.cursor + SET_HEADER_LEN;
                    let end = self.cursor + len;
                    match set_id {
                        TEMPLATE_SET_ID | OPTIONS_TEMPLATE_SET_ID => {
                            self.cursor = end;
                            self.read_template_set(set_id, body, end)?;
                        }
                        id if id >= MIN_DATA_SET_ID => {
                            match self.session.template(TemplateTable::External, id).cloned() {
                                Some(template) => {
                                    self.cursor = body;
                                    self.set_end = end;
                                    self.set_template = Some(template);
                                    self.state = FrameState::SetOpen { set_id: id };
                                }
                                None => {
                                    warn!(
                                        domain = self.session.domain(),
                                        set_id = id,
                                        "No template for data set, skipping"
                                    );
                                    self.cursor = end;
                                }
                            }
                        }
                        other => {
                            self.cursor = end;
                            return Err(Error::malformed(format!("illegal set id {}", other)));
                        }
                    }
                }
                FrameState::SetOpen { set_id } => {
                    let Some(template) = self.set_template.clone() else {
                        self.skip_set();
                        continue;
                    };

                    let min = usize::from(template.wire_len()).max(1);
                    if self.set_end - self.cursor < min {
                        self.skip_set();
                        if !self.options.automatic {
                            return Err(Error::EndOfSet);
                        }
                        continue;
                    }

                    let domain = self.session.domain();
                    if let Some(&kind) = self.special.get(&(domain, set_id)) {
                        self.consume_metadata(kind, &template)?;
                        continue;
                    }
                    return Ok((set_id, template));
                }
            }
        }
    }

    /// Decode the next data record into the selected internal template.
    pub fn next_record(&mut self) -> Result<Record> {
        self.require_collect()?;
        let (_, int) = self.internal.clone().ok_or(TemplateError::NoInternal)?;
        let (tid, ext) = self.position()?;

        let decoded = Transcoder::new(&self.session, &mut self.plans).decode(
            &ext,
            &int,
            &self.input,
            self.cursor,
            self.set_end,
        );
        let (record, consumed) = match decoded {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!(domain = self.session.domain(), tid, error = %e, "Skipping rest of data set");
                self.skip_set();
                return Err(e);
            }
        };

        self.cursor += consumed;
        let domain = self.session.domain();
        self.session.advance_sequence(domain, 1);
        trace!(domain, tid, consumed, "Read record");
        Ok(record)
    }

    /// External template id and template of the next data record, without
    /// consuming it.
    pub fn next_collection_template(&mut self) -> Result<(u16, Arc<Template>)> {
        self.require_collect()?;
        self.position()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infomodel::InfoModel;
    use crate::record::Value;
    use crate::template::ElementSpec;
    use crate::transport::{MemoryCollector, MemoryExporter};

    fn session() -> Session {
        Session::new(Arc::new(InfoModel::with_defaults()))
    }

    fn template(session: &Session) -> Arc<Template> {
        Arc::new(
            Template::from_specs(
                session.model(),
                &[
                    ElementSpec::new("sourceTransportPort", 0, 0),
                    ElementSpec::new("packetDeltaCount", 4, 0),
                ],
            )
            .unwrap(),
        )
    }

    fn exporter_with(tid: u16) -> (MessageBuffer, MemoryExporter, Arc<Template>) {
        let exporter = MemoryExporter::new();
        let mut buffer = MessageBuffer::for_export(session(), exporter.clone());
        buffer.set_export_time(1000);
        let tmpl = template(buffer.session());
        let session = buffer.session_mut();
        session.add_template(TemplateTable::External, tid, tmpl.clone(), None).unwrap();
        session.add_template(TemplateTable::Internal, tid, tmpl.clone(), None).unwrap();
        buffer.set_export_template(tid).unwrap();
        (buffer, exporter, tmpl)
    }

    fn record(tmpl: &Arc<Template>, port: u64, packets: u64) -> Record {
        let mut rec = Record::new(tmpl.clone());
        rec.set_by_name("sourceTransportPort", Value::Unsigned(port)).unwrap();
        rec.set_by_name("packetDeltaCount", Value::Unsigned(packets)).unwrap();
        rec
    }

    #[test]
    fn test_export_announces_template_once() {
        let (mut buffer, exporter, tmpl) = exporter_with(300);
        buffer.append(&record(&tmpl, 80, 5)).unwrap();
        buffer.append(&record(&tmpl, 443, 6)).unwrap();
        buffer.emit().unwrap();

        let messages = exporter.take();
        assert_eq!(messages.len(), 1);
        let m = &messages[0];
        // header + template set (4 + 4 + 2*4) + data set (4 + 2*6)
        assert_eq!(m.len(), 16 + 16 + 16);
        assert_eq!(read_u16(m, 2) as usize, m.len());
        assert_eq!(read_u32(m, 4), 1000);
        assert_eq!(read_u16(m, 16), TEMPLATE_SET_ID);
        assert_eq!(read_u16(m, 32), 300);
        assert_eq!(read_u16(m, 36), 80);
        assert_eq!(read_u32(m, 38), 5);
    }

    #[test]
    fn test_sequence_counts_data_records() {
        let (mut buffer, exporter, tmpl) = exporter_with(300);
        buffer.append(&record(&tmpl, 1, 1)).unwrap();
        buffer.append(&record(&tmpl, 2, 2)).unwrap();
        buffer.emit().unwrap();
        buffer.append(&record(&tmpl, 3, 3)).unwrap();
        buffer.emit().unwrap();

        let messages = exporter.take();
        assert_eq!(read_u32(&messages[0], 8), 0);
        assert_eq!(read_u32(&messages[1], 8), 2);
        assert_eq!(buffer.session().sequence(), 3);
    }

    #[test]
    fn test_manual_mode_reports_full_message() {
        let (buffer, exporter, tmpl) = exporter_with(300);
        let options = BufferOptions {
            automatic: false,
            max_message_len: 60,
            ..Default::default()
        };
        let mut buffer = buffer.with_options(options).unwrap();

        // 16 + 16 (template) + 4 + 6*n <= 60 allows four records.
        for i in 0..4 {
            buffer.append(&record(&tmpl, i, i)).unwrap();
        }
        assert!(matches!(buffer.append(&record(&tmpl, 9, 9)), Err(Error::EndOfMessage)));
        buffer.emit().unwrap();
        buffer.append(&record(&tmpl, 9, 9)).unwrap();
        buffer.emit().unwrap();
        assert_eq!(exporter.len(), 2);
    }

    #[test]
    fn test_automatic_mode_flushes() {
        let (buffer, exporter, tmpl) = exporter_with(300);
        let options = BufferOptions {
            max_message_len: 60,
            ..Default::default()
        };
        let mut buffer = buffer.with_options(options).unwrap();
        for i in 0..10 {
            buffer.append(&record(&tmpl, i, i)).unwrap();
        }
        buffer.emit().unwrap();

        let messages = exporter.take();
        assert!(messages.len() > 1);
        assert!(messages.iter().all(|m| m.len() <= 60));
    }

    #[test]
    fn test_manual_emit_spills_announcements() {
        let (buffer, exporter, tmpl) = exporter_with(300);
        let options = BufferOptions {
            automatic: false,
            max_message_len: 60,
            ..Default::default()
        };
        let mut buffer = buffer.with_options(options).unwrap();
        for i in 0..4 {
            buffer.append(&record(&tmpl, i, i)).unwrap();
        }

        let other = template(buffer.session());
        buffer
            .session_mut()
            .add_template(TemplateTable::External, 301, other, None)
            .unwrap();
        buffer.emit().unwrap();

        let messages = exporter.take();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].len(), 60);
        let last = &messages[1];
        assert_eq!(last.len(), 16 + 16);
        assert_eq!(read_u16(last, 16), TEMPLATE_SET_ID);
        assert_eq!(read_u16(last, 20), 301);

        buffer.append(&record(&tmpl, 9, 9)).unwrap();
        buffer.emit().unwrap();
        assert_eq!(exporter.len(), 1);
    }

    #[test]
    fn test_append_without_export_template() {
        let mut buffer = MessageBuffer::for_export(session(), MemoryExporter::new());
        let tmpl = template(buffer.session());
        let err = buffer.append(&Record::new(tmpl)).unwrap_err();
        assert!(matches!(err, Error::Template(TemplateError::NoExternal)));
    }

    #[test]
    fn test_withdrawal_is_exported() {
        let (mut buffer, exporter, _) = exporter_with(300);
        buffer.emit().unwrap();
        buffer
            .session_mut()
            .remove_template(TemplateTable::External, 300)
            .unwrap();
        buffer.emit().unwrap();

        let messages = exporter.take();
        let last = messages.last().unwrap();
        assert_eq!(last.len(), 16 + 8);
        assert_eq!(read_u16(last, 16), TEMPLATE_SET_ID);
        assert_eq!(read_u16(last, 20), 300);
        assert_eq!(read_u16(last, 22), 0);
        assert!(buffer.export_template().is_none());
    }

    #[test]
    fn test_collect_roundtrip() {
        let (mut export, exporter, tmpl) = exporter_with(300);
        export.append(&record(&tmpl, 80, 5)).unwrap();
        export.append(&record(&tmpl, 443, 6)).unwrap();
        export.emit().unwrap();

        let mut collect = session();
        collect
            .add_template(TemplateTable::Internal, 300, template(&collect), None)
            .unwrap();
        let collector = MemoryCollector::new(exporter.take());
        let mut buffer = MessageBuffer::for_collection(collect, collector);
        buffer.set_internal_template(300).unwrap();

        let first = buffer.next_record().unwrap();
        assert_eq!(first.get_by_name("sourceTransportPort").unwrap().as_u64(), Some(80));
        let second = buffer.next_record().unwrap();
        assert_eq!(second.get_by_name("packetDeltaCount").unwrap().as_u64(), Some(6));
        assert!(matches!(buffer.next_record(), Err(Error::EndOfStream)));
        assert_eq!(buffer.export_time(), 1000);
    }

    #[test]
    fn test_next_record_requires_internal() {
        let mut buffer = MessageBuffer::for_collection(session(), MemoryCollector::default());
        assert!(matches!(
            buffer.next_record(),
            Err(Error::Template(TemplateError::NoInternal))
        ));
    }

    #[test]
    fn test_external_buffer_too_small() {
        let (mut export, exporter, tmpl) = exporter_with(300);
        export.append(&record(&tmpl, 80, 5)).unwrap();
        export.emit().unwrap();
        let message = exporter.take().remove(0);

        let mut collect = session();
        collect
            .add_template(TemplateTable::Internal, 300, template(&collect), None)
            .unwrap();
        let mut buffer = MessageBuffer::from_bytes(collect, message[..20].to_vec());
        buffer.set_internal_template(300).unwrap();

        match buffer.next_record() {
            Err(Error::BufferTooSmall { needed }) => assert_eq!(needed, message.len() - 20),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(buffer.unconsumed().len(), 20);

        buffer.respan(message).unwrap();
        let rec = buffer.next_record().unwrap();
        assert_eq!(rec.get_by_name("sourceTransportPort").unwrap().as_u64(), Some(80));
        assert!(matches!(buffer.next_record(), Err(Error::BufferTooSmall { needed: 16 })));
    }

    #[test]
    fn test_manual_collection_signals() {
        let (mut export, exporter, tmpl) = exporter_with(300);
        export.append(&record(&tmpl, 1, 1)).unwrap();
        export.emit().unwrap();

        let mut collect = session();
        collect
            .add_template(TemplateTable::Internal, 300, template(&collect), None)
            .unwrap();
        let collector = MemoryCollector::new(exporter.take());
        let mut buffer = MessageBuffer::for_collection(collect, collector)
            .with_options(BufferOptions {
                automatic: false,
                ..Default::default()
            })
            .unwrap();
        buffer.set_internal_template(300).unwrap();

        buffer.next_record().unwrap();
        assert!(matches!(buffer.next_record(), Err(Error::EndOfSet)));
        assert!(matches!(buffer.next_record(), Err(Error::EndOfMessage)));
        assert!(matches!(buffer.next_record(), Err(Error::EndOfStream)));
    }

    /// Message header for domain 0 around `sets`.
    fn message_with(sets: &[&[u8]]) -> Vec<u8> {
        let body: Vec<u8> = sets.concat();
        let len = (16 + body.len()) as u16;
        let mut message = vec![0, 10];
        message.extend_from_slice(&len.to_be_bytes());
        message.extend_from_slice(&[0; 12]);
        message.extend_from_slice(&body);
        message
    }

    #[test]
    fn test_invalid_template_record_is_skipped() {
        // 256: ingressInterface with 8 octets (too wide for unsigned32),
        // 257: sourceTransportPort.
        let templates: &[u8] = &[0, 2, 0, 20, 1, 0, 0, 1, 0, 10, 0, 8, 1, 1, 0, 1, 0, 7, 0, 2];
        let data: &[u8] = &[1, 1, 0, 6, 0, 80];
        let message = message_with(&[templates, data]);

        let mut buffer = MessageBuffer::from_bytes(session(), message);
        let port = Arc::new(
            Template::from_specs(
                buffer.session().model(),
                &[ElementSpec::new("sourceTransportPort", 0, 0)],
            )
            .unwrap(),
        );
        let session = buffer.session_mut();
        session.add_template(TemplateTable::Internal, 257, port, None).unwrap();
        buffer.set_internal_template(257).unwrap();

        let rec = buffer.next_record().unwrap();
        assert_eq!(rec.get_by_name("sourceTransportPort").unwrap().as_u64(), Some(80));
        assert!(buffer.session().template(TemplateTable::External, 256).is_none());
        assert!(buffer.session().template(TemplateTable::External, 257).is_some());
    }

    #[test]
    fn test_withdraw_all_respects_template_kind() {
        // Data template 256 and options template 257 with one scope field.
        let templates: &[u8] = &[0, 2, 0, 12, 1, 0, 0, 1, 0, 7, 0, 2];
        let options: &[u8] = &[0, 3, 0, 18, 1, 1, 0, 2, 0, 1, 0, 10, 0, 4, 0, 2, 0, 8];
        let withdraw_options: &[u8] = &[0, 3, 0, 8, 0, 3, 0, 0];
        let message = message_with(&[templates, options, withdraw_options]);

        let mut buffer = MessageBuffer::from_bytes(session(), message);
        let tmpl = template(buffer.session());
        buffer
            .session_mut()
            .add_template(TemplateTable::Internal, 400, tmpl, None)
            .unwrap();
        buffer.set_internal_template(400).unwrap();

        assert!(matches!(buffer.next_record(), Err(Error::BufferTooSmall { .. })));
        let session = buffer.session();
        assert!(session.template(TemplateTable::External, 256).is_some());
        assert!(session.template(TemplateTable::External, 257).is_none());

        let withdraw_data: &[u8] = &[0, 2, 0, 8, 0, 2, 0, 0];
        buffer.respan(message_with(&[templates, options, withdraw_data])).unwrap();
        assert!(matches!(buffer.next_record(), Err(Error::BufferTooSmall { .. })));
        let session = buffer.session();
        assert!(session.template(TemplateTable::External, 256).is_none());
        assert!(session.template(TemplateTable::External, 257).is_some());
    }

    #[test]
    fn test_illegal_set_id_is_skipped() {
        let mut message = vec![0, 10, 0, 28, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1];
        message.extend_from_slice(&[0, 5, 0, 4]);
        message.extend_from_slice(&[1, 0x2C, 0, 8, 0, 1, 0, 2]);

        let mut buffer = MessageBuffer::from_bytes(session(), message);
        let tmpl = template(buffer.session());
        buffer
            .session_mut()
            .add_template(TemplateTable::Internal, 400, tmpl, None)
            .unwrap();
        buffer.set_internal_template(400).unwrap();

        assert!(matches!(buffer.next_record(), Err(Error::Malformed(_))));
        // The data set for template 300 has no template and is skipped.
        assert!(matches!(buffer.next_record(), Err(Error::BufferTooSmall { .. })));
    }
}
