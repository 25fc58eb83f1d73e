//! Templates: ordered field layouts shared between sessions.
//!
//! A [`Template`] is built by appending fields, optionally marked as an
//! options template with [`Template::set_scope`], and then handed to one or
//! more sessions as an `Arc<Template>`. Once attached it is frozen.
//!
//! Each template also defines an in-memory record image: fixed-width fields
//! occupy their effective length at [`TemplateField::offset`], variable-length
//! and structured fields occupy a [`DESCRIPTOR_LEN`]-octet slot whose content
//! lives outside the image (see [`crate::record::Record`]).

use std::any::Any;
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use crate::error::TemplateError;
use crate::infomodel::{DataType, IANA_PEN, InfoElement, InfoModel, VARLEN};

/// Largest field count a template record can carry in one message.
pub const MAX_TEMPLATE_FIELDS: usize = 16376;

/// In-memory slot size of a variable-length or structured field.
pub const DESCRIPTOR_LEN: u16 = 16;

/// IANA `paddingOctets`.
pub const PADDING_OCTETS_ID: u16 = 210;

static NEXT_SERIAL: AtomicU64 = AtomicU64::new(1);

/// Opaque application data attached to a template.
pub type TemplateContext = Box<dyn Any + Send + Sync>;

/// A field of a template.
#[derive(Debug, Clone)]
pub struct TemplateField {
    element: Arc<InfoElement>,
    len: u16,
    midx: u16,
    offset: u16,
}

impl TemplateField {
    pub fn element(&self) -> &Arc<InfoElement> {
        &self.element
    }

    /// Effective length, or [`VARLEN`].
    pub fn len(&self) -> u16 {
        self.len
    }

    pub fn is_varlen(&self) -> bool {
        self.len == VARLEN
    }

    /// Repeat index among fields of the same element (0 for the first).
    pub fn midx(&self) -> u16 {
        self.midx
    }

    /// Offset of the field in the in-memory record image.
    pub fn offset(&self) -> u16 {
        self.offset
    }

    /// Octets the field occupies in the in-memory record image.
    pub fn memory_len(&self) -> u16 {
        if self.has_descriptor() {
            DESCRIPTOR_LEN
        } else {
            self.len
        }
    }

    /// Whether the field's content lives outside the record image.
    pub fn has_descriptor(&self) -> bool {
        self.is_varlen() || self.element.data_type.is_list()
    }

    pub fn data_type(&self) -> DataType {
        self.element.data_type
    }

    pub fn ident(&self) -> (u32, u16) {
        self.element.ident()
    }

    pub fn name(&self) -> &str {
        &self.element.name
    }

    pub fn is_padding(&self) -> bool {
        self.ident() == (IANA_PEN, PADDING_OCTETS_ID)
    }
}

/// A template field request by element name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElementSpec {
    pub name: Cow<'static, str>,
    /// Length override; 0 keeps the element's default length.
    pub len: u16,
    /// Application flags; the spec is used only when all of them are wanted.
    pub flags: u32,
}

impl ElementSpec {
    pub const fn new(name: &'static str, len: u16, flags: u32) -> Self {
        Self {
            name: Cow::Borrowed(name),
            len,
            flags,
        }
    }

    pub fn named(name: impl Into<String>, len: u16) -> Self {
        Self {
            name: Cow::Owned(name.into()),
            len,
            flags: 0,
        }
    }

    fn wanted(&self, flags: u32) -> bool {
        self.flags & flags == self.flags
    }
}

/// Options for [`Template::copy`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CopyOptions {
    pub strip_padding: bool,
    pub strip_scope: bool,
}

/// Options for the template comparisons.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompareOptions {
    pub ignore_lengths: bool,
    pub ignore_scope: bool,
    pub ignore_padding: bool,
}

/// Relation of two templates viewed as multisets of elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetRelation {
    Equal,
    /// Every field of the left template is in the right one.
    Subset,
    /// Every field of the right template is in the left one.
    Superset,
    /// Some fields in common.
    Common,
    Disjoint,
}

/// An ordered, shareable field layout.
pub struct Template {
    fields: Vec<TemplateField>,
    index: HashMap<(u32, u16, u16), usize>,
    wire_len: u16,
    memory_len: u16,
    scope: usize,
    varlen: bool,
    lists: [Vec<usize>; 3],
    sessions: AtomicUsize,
    serial: u64,
    context: OnceLock<TemplateContext>,
}

impl Default for Template {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Template {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Template")
            .field("serial", &self.serial)
            .field("fields", &self.fields)
            .field("scope", &self.scope)
            .field("wire_len", &self.wire_len)
            .field("memory_len", &self.memory_len)
            .field("sessions", &self.ref_count())
            .field("has_context", &self.context.get().is_some())
            .finish()
    }
}

fn list_slot(data_type: DataType) -> Option<usize> {
    match data_type {
        DataType::BasicList => Some(0),
        DataType::SubTemplateList => Some(1),
        DataType::SubTemplateMultiList => Some(2),
        _ => None,
    }
}

impl Template {
    /// Create an empty template.
    pub fn new() -> Self {
        Self {
            fields: Vec::new(),
            index: HashMap::new(),
            wire_len: 0,
            memory_len: 0,
            scope: 0,
            varlen: false,
            lists: [Vec::new(), Vec::new(), Vec::new()],
            sessions: AtomicUsize::new(0),
            serial: NEXT_SERIAL.fetch_add(1, Ordering::Relaxed),
            context: OnceLock::new(),
        }
    }

    /// Build a template from element specs, using every spec.
    pub fn from_specs(model: &InfoModel, specs: &[ElementSpec]) -> Result<Self, TemplateError> {
        let mut template = Self::new();
        template.append_spec_array(model, specs, u32::MAX)?;
        Ok(template)
    }

    // --- Building ---

    /// Append a field for `element`; `len` 0 uses the element's default length.
    ///
    /// Returns the position of the new field.
    pub fn append(&mut self, element: Arc<InfoElement>, len: u16) -> Result<usize, TemplateError> {
        if self.is_frozen() {
            return Err(TemplateError::Frozen);
        }
        if self.fields.len() >= MAX_TEMPLATE_FIELDS {
            return Err(TemplateError::TooManyFields {
                max: MAX_TEMPLATE_FIELDS,
            });
        }

        let len = if len == 0 { element.len } else { len };
        if !element.data_type.accepts_len(len) {
            return Err(TemplateError::InvalidLength {
                name: element.name.clone(),
                len,
            });
        }

        let wire_add = if len == VARLEN { 1 } else { len };
        let memory_add = if len == VARLEN || element.data_type.is_list() {
            DESCRIPTOR_LEN
        } else {
            len
        };
        if self.wire_len.checked_add(wire_add).is_none()
            || self.memory_len.checked_add(memory_add).is_none()
        {
            return Err(TemplateError::TooLong);
        }

        Ok(self.push_field(element, len))
    }

    /// Add a field whose length and totals are already known to be valid.
    fn push_field(&mut self, element: Arc<InfoElement>, len: u16) -> usize {
        let mut field = TemplateField {
            element,
            len,
            midx: 0,
            offset: self.memory_len,
        };
        let (pen, id) = field.ident();
        while self.index.contains_key(&(pen, id, field.midx)) {
            field.midx += 1;
        }

        let pos = self.fields.len();
        self.index.insert((pen, id, field.midx), pos);
        if let Some(slot) = list_slot(field.data_type()) {
            self.lists[slot].push(pos);
        }
        self.varlen |= field.has_descriptor();
        self.wire_len += if len == VARLEN { 1 } else { len };
        self.memory_len += field.memory_len();
        self.fields.push(field);
        pos
    }

    /// Append the element with the given `(pen, id)`.
    pub fn append_by_id(
        &mut self,
        model: &InfoModel,
        pen: u32,
        id: u16,
        len: u16,
    ) -> Result<usize, TemplateError> {
        let element = model
            .lookup_by_id(pen, id)
            .ok_or_else(|| TemplateError::UnknownElement(format!("{}/{}", pen, id)))?;
        self.append(element, len)
    }

    /// Append the element named by `spec` if all of its flags are in `flags`.
    ///
    /// Returns whether a field was appended.
    pub fn append_spec(
        &mut self,
        model: &InfoModel,
        spec: &ElementSpec,
        flags: u32,
    ) -> Result<bool, TemplateError> {
        if !spec.wanted(flags) {
            return Ok(false);
        }

        let element = model
            .lookup_by_name(&spec.name)
            .ok_or_else(|| TemplateError::UnknownElement(spec.name.to_string()))?;
        self.append(element, spec.len)?;
        Ok(true)
    }

    /// Append every wanted spec, in order.
    pub fn append_spec_array(
        &mut self,
        model: &InfoModel,
        specs: &[ElementSpec],
        flags: u32,
    ) -> Result<(), TemplateError> {
        for spec in specs {
            self.append_spec(model, spec, flags)?;
        }
        Ok(())
    }

    /// Mark the first `count` fields as the options scope.
    pub fn set_scope(&mut self, count: usize) -> Result<(), TemplateError> {
        if self.is_frozen() {
            return Err(TemplateError::Frozen);
        }
        if self.fields.is_empty() {
            return Err(TemplateError::Empty);
        }
        if self.scope != 0 {
            return Err(TemplateError::ScopeAlreadySet);
        }
        if count == 0 || count > self.fields.len() {
            return Err(TemplateError::InvalidScope {
                scope: count,
                fields: self.fields.len(),
            });
        }

        self.scope = count;
        Ok(())
    }

    // --- Derived state ---

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn fields(&self) -> &[TemplateField] {
        &self.fields
    }

    pub fn field(&self, pos: usize) -> Option<&TemplateField> {
        self.fields.get(pos)
    }

    /// Minimum encoded record length (each variable field counts one octet).
    pub fn wire_len(&self) -> u16 {
        self.wire_len
    }

    /// Length of the in-memory record image.
    pub fn memory_len(&self) -> u16 {
        self.memory_len
    }

    pub fn scope_count(&self) -> usize {
        self.scope
    }

    pub fn is_options(&self) -> bool {
        self.scope > 0
    }

    /// Whether any field is variable-length or structured.
    pub fn has_varlen(&self) -> bool {
        self.varlen
    }

    /// Size of this template's definition inside a template set.
    pub fn template_record_len(&self) -> usize {
        let header = if self.is_options() { 6 } else { 4 };
        header
            + self
                .fields
                .iter()
                .map(|f| if f.ident().0 == IANA_PEN { 4 } else { 8 })
                .sum::<usize>()
    }

    /// Process-unique identity of this template value.
    pub fn serial(&self) -> u64 {
        self.serial
    }

    /// Number of session tables currently holding the template.
    pub fn ref_count(&self) -> usize {
        self.sessions.load(Ordering::Acquire)
    }

    pub fn is_frozen(&self) -> bool {
        self.ref_count() > 0
    }

    pub(crate) fn attach(&self) {
        self.sessions.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn detach(&self) {
        let released = self
            .sessions
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        debug_assert!(released.is_ok(), "template detached more often than attached");
    }

    /// Attach application data; fails if a context is already present.
    pub fn set_context(&self, context: TemplateContext) -> Result<(), TemplateContext> {
        self.context.set(context)
    }

    pub fn context(&self) -> Option<&(dyn Any + Send + Sync)> {
        self.context.get().map(|c| c.as_ref())
    }

    /// Application data downcast to `T`.
    pub fn context_as<T: Any>(&self) -> Option<&T> {
        self.context.get().and_then(|c| c.downcast_ref::<T>())
    }

    // --- Lookup ---

    /// Position of the field with the exact `(pen, id, midx)` identity.
    pub fn position_of(&self, pen: u32, id: u16, midx: u16) -> Option<usize> {
        self.index.get(&(pen, id, midx)).copied()
    }

    fn find_where(
        &self,
        start: usize,
        skip: usize,
        pred: impl Fn(&TemplateField) -> bool,
    ) -> Option<(usize, &TemplateField)> {
        self.fields
            .iter()
            .enumerate()
            .skip(start)
            .filter(|(_, f)| pred(f))
            .nth(skip)
    }

    /// Find the `skip`-th field (from position `start`) of element `(pen, id)`.
    pub fn find_by_ident(
        &self,
        pen: u32,
        id: u16,
        start: usize,
        skip: usize,
    ) -> Option<(usize, &TemplateField)> {
        self.find_where(start, skip, |f| f.ident() == (pen, id))
    }

    pub fn find_by_element(
        &self,
        element: &InfoElement,
        start: usize,
        skip: usize,
    ) -> Option<(usize, &TemplateField)> {
        self.find_by_ident(element.pen, element.id, start, skip)
    }

    pub fn find_by_name(
        &self,
        name: &str,
        start: usize,
        skip: usize,
    ) -> Option<(usize, &TemplateField)> {
        self.find_where(start, skip, |f| f.name() == name)
    }

    /// Find the `skip`-th field of type `data_type` from position `start`.
    pub fn find_by_datatype(
        &self,
        data_type: DataType,
        start: usize,
        skip: usize,
    ) -> Option<(usize, &TemplateField)> {
        match list_slot(data_type) {
            Some(slot) => {
                let positions = &self.lists[slot];
                let first = positions.partition_point(|&p| p < start);
                positions
                    .get(first + skip)
                    .map(|&pos| (pos, &self.fields[pos]))
            }
            None => self.find_where(start, skip, |f| f.data_type() == data_type),
        }
    }

    pub fn contains_element(&self, element: &InfoElement) -> bool {
        self.find_by_element(element, 0, 0).is_some()
    }

    pub fn contains_by_name(&self, name: &str) -> bool {
        self.find_by_name(name, 0, 0).is_some()
    }

    /// Whether every spec wanted by `flags` names an element in this template.
    pub fn contains_spec_array(
        &self,
        model: &InfoModel,
        specs: &[ElementSpec],
        flags: u32,
    ) -> bool {
        specs.iter().filter(|s| s.wanted(flags)).all(|spec| {
            model
                .lookup_by_name(&spec.name)
                .is_some_and(|ie| self.contains_element(&ie))
        })
    }

    // --- Copy and compare ---

    /// Unfrozen copy of this template.
    pub fn copy(&self, options: CopyOptions) -> Template {
        let mut copy = Template::new();
        for (pos, field) in self.fields.iter().enumerate() {
            if options.strip_padding && field.is_padding() {
                continue;
            }
            // A subset of valid fields stays within every limit.
            copy.push_field(field.element.clone(), field.len);
            if pos < self.scope && !options.strip_scope {
                copy.scope += 1;
            }
        }
        copy
    }

    fn compare_keys(&self, options: CompareOptions) -> Vec<(u32, u16, u16)> {
        self.fields
            .iter()
            .filter(|f| !(options.ignore_padding && f.is_padding()))
            .map(|f| {
                let (pen, id) = f.ident();
                (pen, id, if options.ignore_lengths { 0 } else { f.len })
            })
            .collect()
    }

    /// Field-by-field equality.
    ///
    /// This is an equality predicate only; it does not order templates.
    pub fn compare_ordered(&self, other: &Template, options: CompareOptions) -> bool {
        if !options.ignore_scope && self.scope != other.scope {
            return false;
        }
        self.compare_keys(options) == other.compare_keys(options)
    }

    /// Compare the element multisets of two templates.
    ///
    /// Returns the relation of `self` to `other` and the number of matching
    /// fields. This is a predicate only; it does not order templates.
    pub fn compare_as_multiset(
        &self,
        other: &Template,
        options: CompareOptions,
    ) -> (SetRelation, usize) {
        let mut left = self.compare_keys(options);
        let mut right = other.compare_keys(options);
        left.sort_unstable();
        right.sort_unstable();

        let (mut i, mut j, mut matches) = (0, 0, 0);
        while i < left.len() && j < right.len() {
            match left[i].cmp(&right[j]) {
                std::cmp::Ordering::Less => i += 1,
                std::cmp::Ordering::Greater => j += 1,
                std::cmp::Ordering::Equal => {
                    matches += 1;
                    i += 1;
                    j += 1;
                }
            }
        }

        let relation = if matches == left.len() && matches == right.len() {
            if options.ignore_scope || self.scope == other.scope {
                SetRelation::Equal
            } else {
                SetRelation::Common
            }
        } else if matches == 0 {
            SetRelation::Disjoint
        } else if matches == left.len() {
            SetRelation::Subset
        } else if matches == right.len() {
            SetRelation::Superset
        } else {
            SetRelation::Common
        };

        (relation, matches)
    }
}

impl Clone for Template {
    /// Clones are unattached and carry no context.
    fn clone(&self) -> Self {
        self.copy(CopyOptions::default())
    }
}
