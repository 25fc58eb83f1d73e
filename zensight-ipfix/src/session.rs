//! Per-connection template state.
//!
//! A [`Session`] holds one session-global internal template table and, per
//! observation domain, an external template table, the TemplateInfo of those
//! templates and a sequence number counter.
//!
//! Sessions count themselves into each template they hold (see
//! [`Template::ref_count`]), which freezes the template. While a
//! [`MessageBuffer`](crate::message::MessageBuffer) is attached, template
//! changes are queued as events the buffer consumes: announcements and
//! withdrawals to serialize when exporting, and revocations that purge its
//! plan cache.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use crate::error::{Result, TemplateError};
use crate::infomodel::InfoModel;
use crate::metadata::{MetadataKind, TemplateInfo, metadata_template};
use crate::template::{Template, TemplateContext};

/// Template id requesting automatic assignment.
pub const AUTO: u16 = 0;

/// Smallest template id usable by templates (0-255 are reserved).
pub const MIN_TEMPLATE_ID: u16 = 256;

/// Which template table an operation addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TemplateTable {
    /// In-memory layouts, shared by every domain.
    Internal,
    /// Wire layouts of the current observation domain.
    External,
}

/// Decision returned by a [`TemplateObserver`].
pub enum TemplateAction {
    Accept,
    /// Accept and attach application data to the template.
    AcceptWithContext(TemplateContext),
    /// Do not register the template; its data sets are skipped.
    Reject,
}

impl fmt::Debug for TemplateAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TemplateAction::Accept => f.write_str("Accept"),
            TemplateAction::AcceptWithContext(_) => f.write_str("AcceptWithContext(..)"),
            TemplateAction::Reject => f.write_str("Reject"),
        }
    }
}

/// Notified of every template received from a peer, and of every internal
/// template copied by [`Session::clone_session`].
pub trait TemplateObserver: Send + Sync {
    fn on_new_template(&self, session: &Session, tid: u16, template: &Arc<Template>)
    -> TemplateAction;
}

impl<F> TemplateObserver for F
where
    F: Fn(&Session, u16, &Arc<Template>) -> TemplateAction + Send + Sync,
{
    fn on_new_template(
        &self,
        session: &Session,
        tid: u16,
        template: &Arc<Template>,
    ) -> TemplateAction {
        self(session, tid, template)
    }
}

/// Template changes consumed by an attached message buffer.
#[derive(Debug, Clone)]
pub(crate) enum SessionEvent {
    Announce {
        domain: u32,
        tid: u16,
        template: Arc<Template>,
        info: Option<TemplateInfo>,
    },
    Withdraw {
        domain: u32,
        tid: u16,
        options: bool,
    },
    Revoked {
        serial: u64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Attachment {
    Detached,
    Export,
    Collect,
}

#[derive(Debug)]
struct DomainState {
    templates: BTreeMap<u16, Arc<Template>>,
    info: HashMap<u16, TemplateInfo>,
    metadata: HashMap<MetadataKind, u16>,
    sequence: u32,
    next_external: u16,
}

impl DomainState {
    fn new() -> Self {
        Self {
            templates: BTreeMap::new(),
            info: HashMap::new(),
            metadata: HashMap::new(),
            sequence: 0,
            next_external: MIN_TEMPLATE_ID,
        }
    }
}

/// Metadata export order: list records are nested in TemplateInfo records,
/// so their template is announced first.
const METADATA_KINDS: [MetadataKind; 3] = [
    MetadataKind::BasicListInfo,
    MetadataKind::TemplateInfo,
    MetadataKind::ElementType,
];

/// Template state of one IPFIX connection.
pub struct Session {
    model: Arc<InfoModel>,
    internal: BTreeMap<u16, Arc<Template>>,
    next_internal: u16,
    domains: HashMap<u32, DomainState>,
    domain: u32,
    pairs: HashMap<u16, u16>,
    observer: Option<Arc<dyn TemplateObserver>>,
    metadata: HashMap<MetadataKind, Arc<Template>>,
    attachment: Attachment,
    events: VecDeque<SessionEvent>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("domain", &self.domain)
            .field("internal", &self.internal.keys().collect::<Vec<_>>())
            .field("external", &self.external_template_ids())
            .field("pairs", &self.pairs)
            .field("has_observer", &self.observer.is_some())
            .field("attachment", &self.attachment)
            .finish()
    }
}

impl Session {
    /// Create an empty session on domain 0.
    pub fn new(model: Arc<InfoModel>) -> Self {
        let mut domains = HashMap::new();
        domains.insert(0, DomainState::new());

        Self {
            model,
            internal: BTreeMap::new(),
            next_internal: u16::MAX,
            domains,
            domain: 0,
            pairs: HashMap::new(),
            observer: None,
            metadata: HashMap::new(),
            attachment: Attachment::Detached,
            events: VecDeque::new(),
        }
    }

    pub fn model(&self) -> &Arc<InfoModel> {
        &self.model
    }

    // --- Templates ---

    fn domain_state(&mut self) -> &mut DomainState {
        self.domains.entry(self.domain).or_insert_with(DomainState::new)
    }

    fn current(&self) -> Option<&DomainState> {
        self.domains.get(&self.domain)
    }

    fn allocate(&mut self, table: TemplateTable) -> std::result::Result<u16, TemplateError> {
        match table {
            TemplateTable::Internal => {
                let start = self.next_internal;
                let mut tid = start;
                while self.internal.contains_key(&tid) {
                    tid = if tid == MIN_TEMPLATE_ID { u16::MAX } else { tid - 1 };
                    if tid == start {
                        return Err(TemplateError::IdsExhausted);
                    }
                }
                self.next_internal = if tid == MIN_TEMPLATE_ID { u16::MAX } else { tid - 1 };
                Ok(tid)
            }
            TemplateTable::External => {
                let state = self.domain_state();
                let start = state.next_external;
                let mut tid = start;
                while state.templates.contains_key(&tid) {
                    tid = if tid == u16::MAX { MIN_TEMPLATE_ID } else { tid + 1 };
                    if tid == start {
                        return Err(TemplateError::IdsExhausted);
                    }
                }
                state.next_external = if tid == u16::MAX { MIN_TEMPLATE_ID } else { tid + 1 };
                Ok(tid)
            }
        }
    }

    fn release(&mut self, template: Arc<Template>) {
        template.detach();
        if self.attachment != Attachment::Detached {
            self.events.push_back(SessionEvent::Revoked {
                serial: template.serial(),
            });
        }
    }

    /// Add `template` under `tid`, or under a fresh id when `tid` is [`AUTO`].
    ///
    /// A template already registered at that id is replaced and released.
    /// External templates are announced to an attached exporting buffer,
    /// together with `info` when template metadata export is enabled.
    ///
    /// Returns the id the template was registered under.
    pub fn add_template(
        &mut self,
        table: TemplateTable,
        tid: u16,
        template: Arc<Template>,
        info: Option<TemplateInfo>,
    ) -> Result<u16> {
        if template.is_empty() {
            return Err(TemplateError::Empty.into());
        }
        if tid != AUTO && tid < MIN_TEMPLATE_ID {
            return Err(TemplateError::ReservedId(tid).into());
        }
        let tid = if tid == AUTO {
            self.allocate(table)?
        } else {
            tid
        };

        template.attach();
        let replaced = match table {
            TemplateTable::Internal => self.internal.insert(tid, template.clone()),
            TemplateTable::External => {
                let state = self.domain_state();
                match info.clone() {
                    Some(mut info) => {
                        info.tid = tid;
                        state.info.insert(tid, info);
                    }
                    None => {
                        state.info.remove(&tid);
                    }
                }
                state.templates.insert(tid, template.clone())
            }
        };
        if let Some(old) = replaced {
            self.release(old);
        }

        tracing::debug!(
            table = ?table,
            domain = self.domain,
            tid,
            fields = template.len(),
            scope = template.scope_count(),
            "Added template"
        );

        if table == TemplateTable::External && self.attachment == Attachment::Export {
            let info = info.map(|mut info| {
                info.tid = tid;
                info
            });
            self.events.push_back(SessionEvent::Announce {
                domain: self.domain,
                tid,
                template,
                info,
            });
        }

        Ok(tid)
    }

    /// Remove the template registered under `tid`.
    ///
    /// Removing an external template while exporting queues a withdrawal.
    pub fn remove_template(&mut self, table: TemplateTable, tid: u16) -> Result<()> {
        let removed = match table {
            TemplateTable::Internal => self.internal.remove(&tid),
            TemplateTable::External => {
                let state = self.domain_state();
                state.info.remove(&tid);
                state.metadata.retain(|_, meta_tid| *meta_tid != tid);
                state.templates.remove(&tid)
            }
        };

        let template = removed.ok_or(match table {
            TemplateTable::Internal => TemplateError::MissingInternal(tid),
            TemplateTable::External => TemplateError::MissingExternal(tid),
        })?;

        tracing::debug!(table = ?table, domain = self.domain, tid, "Removed template");

        if table == TemplateTable::External && self.attachment == Attachment::Export {
            self.events.push_back(SessionEvent::Withdraw {
                domain: self.domain,
                tid,
                options: template.is_options(),
            });
        }
        self.release(template);

        Ok(())
    }

    /// Remove every external template of the current domain of one kind:
    /// options templates when `options` is set, data templates otherwise.
    ///
    /// Returns the removed ids.
    pub fn remove_all_external(&mut self, options: bool) -> Vec<u16> {
        let tids: Vec<u16> = self
            .current()
            .map(|s| {
                s.templates
                    .iter()
                    .filter(|(_, t)| t.is_options() == options)
                    .map(|(&tid, _)| tid)
                    .collect()
            })
            .unwrap_or_default();
        tids.into_iter()
            .filter(|&tid| self.remove_template(TemplateTable::External, tid).is_ok())
            .collect()
    }

    /// Template registered under `tid` (external: current domain).
    pub fn template(&self, table: TemplateTable, tid: u16) -> Option<&Arc<Template>> {
        match table {
            TemplateTable::Internal => self.internal.get(&tid),
            TemplateTable::External => self.current()?.templates.get(&tid),
        }
    }

    pub(crate) fn external_in(&self, domain: u32, tid: u16) -> Option<&Arc<Template>> {
        self.domains.get(&domain)?.templates.get(&tid)
    }

    /// Metadata of an external template of the current domain.
    pub fn template_info(&self, tid: u16) -> Option<&TemplateInfo> {
        self.current()?.info.get(&tid)
    }

    /// Attach metadata to an external template of the current domain.
    pub fn set_template_info(&mut self, tid: u16, mut info: TemplateInfo) -> Result<()> {
        let state = self.domain_state();
        if !state.templates.contains_key(&tid) {
            return Err(TemplateError::MissingExternal(tid).into());
        }
        info.tid = tid;
        state.info.insert(tid, info);
        Ok(())
    }

    /// Ids of the external templates of the current domain, ascending.
    pub fn external_template_ids(&self) -> Vec<u16> {
        self.current()
            .map(|s| s.templates.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Ids of the internal templates, ascending.
    pub fn internal_template_ids(&self) -> Vec<u16> {
        self.internal.keys().copied().collect()
    }

    /// Register a template received from the peer, consulting the observer.
    ///
    /// Returns `false` when the observer rejected it; any previous template
    /// under `tid` is then dropped as stale.
    pub(crate) fn receive_template(&mut self, tid: u16, template: Arc<Template>) -> Result<bool> {
        if let Some(observer) = self.observer.clone() {
            match observer.on_new_template(self, tid, &template) {
                TemplateAction::Accept => {}
                TemplateAction::AcceptWithContext(context) => {
                    if template.set_context(context).is_err() {
                        tracing::debug!(tid, "Template already carries a context");
                    }
                }
                TemplateAction::Reject => {
                    tracing::warn!(domain = self.domain, tid, "Template rejected by observer");
                    if self.template(TemplateTable::External, tid).is_some() {
                        self.remove_template(TemplateTable::External, tid)?;
                    }
                    return Ok(false);
                }
            }
        }

        self.add_template(TemplateTable::External, tid, template, None)?;
        Ok(true)
    }

    // --- Domains and sequence numbers ---

    /// Switch the observation domain, creating its state on first use.
    pub fn set_domain(&mut self, domain: u32) -> Result<()> {
        if domain == self.domain {
            return Ok(());
        }

        tracing::trace!(from = self.domain, to = domain, "Switching observation domain");
        self.domain = domain;
        self.domain_state();
        self.register_metadata_templates()
    }

    pub fn domain(&self) -> u32 {
        self.domain
    }

    /// Sequence number of the current domain.
    pub fn sequence(&self) -> u32 {
        self.current().map(|s| s.sequence).unwrap_or(0)
    }

    pub fn set_sequence(&mut self, sequence: u32) {
        self.domain_state().sequence = sequence;
    }

    pub(crate) fn sequence_of(&self, domain: u32) -> u32 {
        self.domains.get(&domain).map(|s| s.sequence).unwrap_or(0)
    }

    pub(crate) fn advance_sequence(&mut self, domain: u32, count: u32) {
        let state = self.domains.entry(domain).or_insert_with(DomainState::new);
        state.sequence = state.sequence.wrapping_add(count);
    }

    // --- Template pairs ---

    /// Decode nested records of external template `ext` with internal `int`.
    ///
    /// `int` 0 disables decoding of `ext` in lists. Once any pair exists,
    /// external ids without a pair are skipped as well. A pair naming an
    /// internal template that is not defined decodes with `ext` itself.
    pub fn add_pair(&mut self, ext: u16, int: u16) {
        self.pairs.insert(ext, int);
    }

    pub fn remove_pair(&mut self, ext: u16) {
        self.pairs.remove(&ext);
    }

    /// Internal template id for nested records of `ext`; 0 means skip.
    ///
    /// Without any pair every id maps to itself.
    pub fn lookup_pair(&self, ext: u16) -> u16 {
        if self.pairs.is_empty() {
            ext
        } else {
            self.pairs.get(&ext).copied().unwrap_or(0)
        }
    }

    // --- Observer ---

    pub fn set_observer(&mut self, observer: Arc<dyn TemplateObserver>) {
        self.observer = Some(observer);
    }

    pub fn clear_observer(&mut self) {
        self.observer = None;
    }

    /// Fresh session sharing this session's model, observer, internal
    /// templates and metadata settings.
    pub fn clone_session(&self) -> Session {
        let mut clone = Session::new(self.model.clone());
        clone.observer = self.observer.clone();
        clone.metadata = self.metadata.clone();

        for (&tid, template) in &self.internal {
            if let Some(observer) = &clone.observer {
                match observer.on_new_template(&clone, tid, template) {
                    TemplateAction::Accept => {}
                    TemplateAction::AcceptWithContext(context) => {
                        if template.set_context(context).is_err() {
                            tracing::debug!(tid, "Template already carries a context");
                        }
                    }
                    TemplateAction::Reject => continue,
                }
            }
            template.attach();
            clone.internal.insert(tid, template.clone());
        }

        if let Err(e) = clone.register_metadata_templates() {
            tracing::warn!(error = %e, "Cannot register metadata templates on cloned session");
        }
        clone
    }

    // --- Metadata ---

    fn enable_metadata(&mut self, kinds: &[MetadataKind], enabled: bool) -> Result<()> {
        if enabled {
            for &kind in kinds {
                if !self.metadata.contains_key(&kind) {
                    let template = Arc::new(metadata_template(&self.model, kind)?);
                    self.add_template(TemplateTable::Internal, AUTO, template.clone(), None)?;
                    self.metadata.insert(kind, template);
                }
            }
            return self.register_metadata_templates();
        }

        for kind in kinds {
            let Some(template) = self.metadata.remove(kind) else {
                continue;
            };
            let internal: Vec<u16> = self
                .internal
                .iter()
                .filter(|(_, t)| Arc::ptr_eq(t, &template))
                .map(|(&tid, _)| tid)
                .collect();
            for tid in internal {
                self.remove_template(TemplateTable::Internal, tid)?;
            }

            let current = self.domain;
            let domains: Vec<u32> = self.domains.keys().copied().collect();
            for domain in domains {
                let tid = self.domains.get(&domain).and_then(|s| s.metadata.get(kind).copied());
                if let Some(tid) = tid {
                    self.domain = domain;
                    if let Err(e) = self.remove_template(TemplateTable::External, tid) {
                        tracing::debug!(domain, tid, error = %e, "Metadata template already gone");
                    }
                }
            }
            self.domain = current;
        }
        Ok(())
    }

    /// Register the enabled metadata templates in the current domain.
    fn register_metadata_templates(&mut self) -> Result<()> {
        for kind in METADATA_KINDS {
            let Some(template) = self.metadata.get(&kind).cloned() else {
                continue;
            };
            if self.domain_state().metadata.contains_key(&kind) {
                continue;
            }
            let tid = self.add_template(TemplateTable::External, AUTO, template, None)?;
            self.domain_state().metadata.insert(kind, tid);
        }
        Ok(())
    }

    /// Export TemplateInfo records along with template announcements.
    pub fn enable_template_metadata(&mut self, enabled: bool) -> Result<()> {
        self.enable_metadata(
            &[MetadataKind::BasicListInfo, MetadataKind::TemplateInfo],
            enabled,
        )
    }

    /// Allow RFC 5610 element-type records to be exported.
    pub fn enable_element_metadata(&mut self, enabled: bool) -> Result<()> {
        self.enable_metadata(&[MetadataKind::ElementType], enabled)
    }

    pub fn template_metadata_enabled(&self) -> bool {
        self.metadata.contains_key(&MetadataKind::TemplateInfo)
    }

    pub fn element_metadata_enabled(&self) -> bool {
        self.metadata.contains_key(&MetadataKind::ElementType)
    }

    /// External id and template of a metadata kind in the current domain.
    pub fn metadata_template(&self, kind: MetadataKind) -> Option<(u16, &Arc<Template>)> {
        let tid = *self.current()?.metadata.get(&kind)?;
        Some((tid, self.metadata.get(&kind)?))
    }

    pub(crate) fn metadata_template_in(
        &self,
        domain: u32,
        kind: MetadataKind,
    ) -> Option<(u16, Arc<Template>)> {
        let tid = *self.domains.get(&domain)?.metadata.get(&kind)?;
        Some((tid, self.metadata.get(&kind)?.clone()))
    }

    /// Whether `tid` is one of the metadata templates of `domain`.
    pub(crate) fn is_metadata_tid(&self, domain: u32, tid: u16) -> bool {
        self.domains
            .get(&domain)
            .is_some_and(|s| s.metadata.values().any(|&t| t == tid))
    }

    // --- Buffer attachment ---

    pub(crate) fn attach(&mut self, attachment: Attachment) {
        self.attachment = attachment;
        self.events.clear();
    }

    pub(crate) fn detach(&mut self) {
        self.attachment = Attachment::Detached;
        self.events.clear();
    }

    pub(crate) fn drain_events(&mut self) -> VecDeque<SessionEvent> {
        std::mem::take(&mut self.events)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        for template in self.internal.values() {
            template.detach();
        }
        for state in self.domains.values() {
            for template in state.templates.values() {
                template.detach();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::template::ElementSpec;

    fn model() -> Arc<InfoModel> {
        Arc::new(InfoModel::with_defaults())
    }

    fn template(model: &InfoModel, names: &[&'static str]) -> Arc<Template> {
        let specs: Vec<_> = names.iter().map(|n| ElementSpec::new(n, 0, 0)).collect();
        Arc::new(Template::from_specs(model, &specs).unwrap())
    }

    #[test]
    fn test_auto_ids() {
        let model = model();
        let mut session = Session::new(model.clone());
        let t = template(&model, &["sourceIPv4Address"]);

        let mut add = |table, tid| session.add_template(table, tid, t.clone(), None).unwrap();
        assert_eq!(add(TemplateTable::Internal, AUTO), 65535);
        assert_eq!(add(TemplateTable::Internal, AUTO), 65534);
        assert_eq!(add(TemplateTable::External, AUTO), 256);
        assert_eq!(add(TemplateTable::External, 257), 257);
        assert_eq!(add(TemplateTable::External, AUTO), 258);
        assert_eq!(t.ref_count(), 5);
    }

    #[test]
    fn test_reserved_ids() {
        let model = model();
        let mut session = Session::new(model.clone());
        let t = template(&model, &["sourceIPv4Address"]);

        let err = session.add_template(TemplateTable::External, 255, t.clone(), None);
        assert!(matches!(err, Err(Error::Template(TemplateError::ReservedId(255)))));
        assert_eq!(t.ref_count(), 0);

        let empty = Arc::new(Template::new());
        assert!(session.add_template(TemplateTable::External, 300, empty, None).is_err());
    }

    #[test]
    fn test_replace_and_release() {
        let model = model();
        let mut session = Session::new(model.clone());
        let a = template(&model, &["sourceIPv4Address"]);
        let b = template(&model, &["destinationIPv4Address"]);

        session.add_template(TemplateTable::External, 300, a.clone(), None).unwrap();
        assert!(a.is_frozen());
        session.add_template(TemplateTable::External, 300, b.clone(), None).unwrap();
        assert_eq!(a.ref_count(), 0);
        assert!(Arc::ptr_eq(session.template(TemplateTable::External, 300).unwrap(), &b));

        session.remove_template(TemplateTable::External, 300).unwrap();
        assert_eq!(b.ref_count(), 0);
        assert!(matches!(
            session.remove_template(TemplateTable::External, 300),
            Err(Error::Template(TemplateError::MissingExternal(300)))
        ));
    }

    #[test]
    fn test_drop_releases_templates() {
        let model = model();
        let t = template(&model, &["sourceIPv4Address"]);
        {
            let mut session = Session::new(model.clone());
            session.add_template(TemplateTable::Internal, 256, t.clone(), None).unwrap();
            session.add_template(TemplateTable::External, 256, t.clone(), None).unwrap();
            assert_eq!(t.ref_count(), 2);
        }
        assert_eq!(t.ref_count(), 0);
    }

    #[test]
    fn test_domain_isolation() {
        let model = model();
        let mut session = Session::new(model.clone());
        let one = template(&model, &["sourceIPv4Address"]);
        let two = template(&model, &["octetTotalCount", "packetTotalCount"]);

        session.set_domain(1).unwrap();
        session.add_template(TemplateTable::External, 256, one.clone(), None).unwrap();
        session.set_sequence(10);
        session.set_domain(2).unwrap();
        session.add_template(TemplateTable::External, 256, two.clone(), None).unwrap();
        assert_eq!(session.sequence(), 0);

        session.set_domain(1).unwrap();
        let found = session.template(TemplateTable::External, 256).unwrap();
        assert!(Arc::ptr_eq(found, &one));
        assert_eq!(session.sequence(), 10);
        assert_eq!(one.ref_count(), 1);
        assert_eq!(two.ref_count(), 1);
    }

    #[test]
    fn test_internal_templates_are_global() {
        let model = model();
        let mut session = Session::new(model.clone());
        let t = template(&model, &["sourceIPv4Address"]);

        session.add_template(TemplateTable::Internal, 999, t, None).unwrap();
        session.set_domain(7).unwrap();
        assert!(session.template(TemplateTable::Internal, 999).is_some());
        assert!(session.template(TemplateTable::External, 999).is_none());
    }

    #[test]
    fn test_pairs() {
        let model = model();
        let mut session = Session::new(model);

        assert_eq!(session.lookup_pair(300), 300);
        session.add_pair(300, 0);
        assert_eq!(session.lookup_pair(300), 0);
        assert_eq!(session.lookup_pair(301), 0);
        session.add_pair(301, 500);
        assert_eq!(session.lookup_pair(301), 500);

        session.remove_pair(300);
        session.remove_pair(301);
        assert_eq!(session.lookup_pair(302), 302);
    }

    #[test]
    fn test_observer_reject() {
        let model = model();
        let mut session = Session::new(model.clone());
        session.set_observer(Arc::new(|_: &Session, tid: u16, _: &Arc<Template>| {
            if tid == 300 {
                TemplateAction::Reject
            } else {
                TemplateAction::AcceptWithContext(Box::new(format!("tid {}", tid)))
            }
        }));

        let t = template(&model, &["sourceIPv4Address"]);
        assert!(!session.receive_template(300, t.clone()).unwrap());
        assert!(session.template(TemplateTable::External, 300).is_none());

        assert!(session.receive_template(301, t.clone()).unwrap());
        assert_eq!(t.context_as::<String>().map(String::as_str), Some("tid 301"));
    }

    #[test]
    fn test_clone_session() {
        let model = model();
        let mut session = Session::new(model.clone());
        let kept = template(&model, &["sourceIPv4Address"]);
        let dropped = template(&model, &["destinationIPv4Address"]);
        session.add_template(TemplateTable::Internal, 400, kept.clone(), None).unwrap();
        session.add_template(TemplateTable::Internal, 401, dropped.clone(), None).unwrap();
        session.add_template(TemplateTable::External, 256, kept.clone(), None).unwrap();
        session.set_observer(Arc::new(|_: &Session, tid: u16, _: &Arc<Template>| {
            if tid == 401 {
                TemplateAction::Reject
            } else {
                TemplateAction::Accept
            }
        }));

        let clone = session.clone_session();
        assert_eq!(clone.internal_template_ids(), vec![400]);
        assert!(clone.external_template_ids().is_empty());
        assert_eq!(kept.ref_count(), 3);
        assert_eq!(dropped.ref_count(), 1);

        drop(clone);
        assert_eq!(kept.ref_count(), 2);
    }

    #[test]
    fn test_events_only_when_exporting() {
        let model = model();
        let mut session = Session::new(model.clone());
        let t = template(&model, &["sourceIPv4Address"]);

        session.add_template(TemplateTable::External, 256, t.clone(), None).unwrap();
        assert!(session.drain_events().is_empty());

        session.attach(Attachment::Export);
        session.add_template(TemplateTable::External, 257, t.clone(), None).unwrap();
        session.remove_template(TemplateTable::External, 256).unwrap();

        let events: Vec<_> = session.drain_events().into_iter().collect();
        assert!(matches!(events[0], SessionEvent::Announce { tid: 257, .. }));
        assert!(matches!(events[1], SessionEvent::Withdraw { tid: 256, options: false, .. }));
        assert!(matches!(events[2], SessionEvent::Revoked { serial } if serial == t.serial()));
    }

    #[test]
    fn test_template_metadata_registration() {
        let model = model();
        let mut session = Session::new(model.clone());
        session.enable_template_metadata(true).unwrap();

        assert!(session.template_metadata_enabled());
        let (list_tid, _) = session.metadata_template(MetadataKind::BasicListInfo).unwrap();
        let (info_tid, info) = session.metadata_template(MetadataKind::TemplateInfo).unwrap();
        assert_eq!(list_tid, 256);
        assert_eq!(info_tid, 257);
        assert!(info.is_options());

        session.set_domain(3).unwrap();
        assert_eq!(session.external_template_ids(), vec![256, 257]);

        session.enable_template_metadata(false).unwrap();
        assert!(session.external_template_ids().is_empty());
        assert!(session.internal_template_ids().is_empty());
        session.set_domain(0).unwrap();
        assert!(session.external_template_ids().is_empty());
    }

    #[test]
    fn test_element_metadata_needs_model() {
        let mut session = Session::new(Arc::new(InfoModel::new()));
        assert!(matches!(
            session.enable_element_metadata(true),
            Err(Error::Setup(_))
        ));
    }
}
