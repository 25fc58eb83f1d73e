//! Template and element metadata.
//!
//! Two kinds of options records describe other parts of a session:
//!
//! - TemplateInfo records (CERT enterprise elements) carry a template's
//!   name, description, parent template and the element identities used by
//!   its basicList fields.
//! - RFC 5610 element-type records describe enterprise information elements
//!   so a collector can register them in its model.

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::infomodel::{CERT_PEN, DataType, IANA_PEN, InfoElement, InfoModel, Semantics, Units};
use crate::record::{ListSemantic, Record, SubTemplateList, Value, Varfield};
use crate::template::Template;

const TEMPLATE_ID: u16 = 145;
const ELEMENT_ID: u16 = 303;
const ELEMENT_DATA_TYPE: u16 = 339;
const ELEMENT_DESCRIPTION: u16 = 340;
const ELEMENT_NAME: u16 = 341;
const ELEMENT_RANGE_BEGIN: u16 = 342;
const ELEMENT_RANGE_END: u16 = 343;
const ELEMENT_SEMANTICS: u16 = 344;
const ELEMENT_UNITS: u16 = 345;
const ENTERPRISE_NUMBER: u16 = 346;

const TEMPLATE_NAME: u16 = 1000;
const TEMPLATE_DESCRIPTION: u16 = 1001;
const PARENT_TEMPLATE_ID: u16 = 1002;
const TEMPLATE_ELEMENT_LIST: u16 = 1003;

/// Metadata template kinds a session can export.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetadataKind {
    TemplateInfo,
    BasicListInfo,
    ElementType,
}

/// Parent linkage of a template.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum TemplateParent {
    /// The record did not say (legacy metadata without a parent field).
    #[default]
    Unknown,
    /// Not nested in any other template.
    TopLevel,
    /// Used inside lists of the given template.
    Template(u16),
}

impl TemplateParent {
    fn to_wire(self) -> u16 {
        match self {
            TemplateParent::Template(tid) => tid,
            TemplateParent::Unknown | TemplateParent::TopLevel => 0,
        }
    }
}

/// Element identities behind one basicList field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BasicListInfo {
    /// `(pen, id)` of the list field's element.
    pub list_element: (u32, u16),
    /// `(pen, id)` of the element carried in the list.
    pub content_element: (u32, u16),
}

/// Descriptive metadata of a template.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TemplateInfo {
    /// Template id; filled in when the info is attached to a session.
    pub tid: u16,
    pub name: String,
    pub description: Option<String>,
    pub parent: TemplateParent,
    pub lists: Vec<BasicListInfo>,
}

impl TemplateInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parent: TemplateParent::TopLevel,
            ..Default::default()
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_parent(mut self, parent: TemplateParent) -> Self {
        self.parent = parent;
        self
    }

    /// Record the content element of a basicList field.
    pub fn add_basic_list(&mut self, list: &InfoElement, content: &InfoElement) {
        self.lists.push(BasicListInfo {
            list_element: list.ident(),
            content_element: content.ident(),
        });
    }

    /// Build the TemplateInfo record for this info.
    ///
    /// `template` must be a TemplateInfo template; `list_tid` is the external
    /// id under which `list_template` (a BasicListInfo template) is exported.
    pub fn to_record(
        &self,
        template: &Arc<Template>,
        list_tid: u16,
        list_template: &Arc<Template>,
    ) -> Result<Record> {
        let mut record = Record::new(template.clone());
        set(&mut record, IANA_PEN, TEMPLATE_ID, 0, Value::Unsigned(u64::from(self.tid)))?;
        set(
            &mut record,
            CERT_PEN,
            PARENT_TEMPLATE_ID,
            0,
            Value::Unsigned(u64::from(self.parent.to_wire())),
        )?;
        set(&mut record, CERT_PEN, TEMPLATE_NAME, 0, Value::String(&self.name))?;
        if let Some(description) = &self.description {
            set(&mut record, CERT_PEN, TEMPLATE_DESCRIPTION, 0, Value::String(description))?;
        }

        let mut list = SubTemplateList::new(list_tid, ListSemantic::AllOf);
        for info in &self.lists {
            let mut entry = Record::new(list_template.clone());
            let (list_pen, list_id) = info.list_element;
            let (content_pen, content_id) = info.content_element;
            set(&mut entry, IANA_PEN, ENTERPRISE_NUMBER, 0, Value::Unsigned(u64::from(list_pen)))?;
            set(&mut entry, IANA_PEN, ELEMENT_ID, 0, Value::Unsigned(u64::from(list_id)))?;
            let content_pen = Value::Unsigned(u64::from(content_pen));
            set(&mut entry, IANA_PEN, ENTERPRISE_NUMBER, 1, content_pen)?;
            set(&mut entry, IANA_PEN, ELEMENT_ID, 1, Value::Unsigned(u64::from(content_id)))?;
            list.push(entry);
        }
        if let Some((pos, _)) = template.find_by_ident(CERT_PEN, TEMPLATE_ELEMENT_LIST, 0, 0) {
            record.set_varfield(pos, Varfield::SubTemplateList(list))?;
        }

        Ok(record)
    }

    /// Read a TemplateInfo record; `None` when it names no template.
    pub fn from_record(record: &Record) -> Option<TemplateInfo> {
        let tid = u16::try_from(unsigned(record, IANA_PEN, TEMPLATE_ID, 0)?).ok()?;
        let name = string(record, CERT_PEN, TEMPLATE_NAME).unwrap_or_default();
        let description = string(record, CERT_PEN, TEMPLATE_DESCRIPTION).filter(|d| !d.is_empty());

        let parent = match unsigned(record, CERT_PEN, PARENT_TEMPLATE_ID, 0) {
            None => TemplateParent::Unknown,
            Some(0) => TemplateParent::TopLevel,
            Some(parent) => TemplateParent::Template(u16::try_from(parent).ok()?),
        };

        let lists = record
            .template()
            .find_by_ident(CERT_PEN, TEMPLATE_ELEMENT_LIST, 0, 0)
            .and_then(|(pos, _)| record.sub_template_list(pos))
            .map(|stl| stl.records.iter().filter_map(basic_list_info).collect())
            .unwrap_or_default();

        Some(TemplateInfo {
            tid,
            name,
            description,
            parent,
            lists,
        })
    }
}

fn basic_list_info(record: &Record) -> Option<BasicListInfo> {
    let ident = |skip| -> Option<(u32, u16)> {
        let pen = unsigned(record, IANA_PEN, ENTERPRISE_NUMBER, skip).unwrap_or(0);
        let id = unsigned(record, IANA_PEN, ELEMENT_ID, skip)?;
        Some((u32::try_from(pen).ok()?, u16::try_from(id).ok()?))
    };

    Some(BasicListInfo {
        list_element: ident(0)?,
        content_element: ident(1)?,
    })
}

fn set(record: &mut Record, pen: u32, id: u16, skip: usize, value: Value<'_>) -> Result<()> {
    match record.template().find_by_ident(pen, id, 0, skip) {
        Some((pos, _)) => record.set(pos, value),
        None => Ok(()),
    }
}

fn unsigned(record: &Record, pen: u32, id: u16, skip: usize) -> Option<u64> {
    let (pos, _) = record.template().find_by_ident(pen, id, 0, skip)?;
    record.get(pos)?.as_u64()
}

fn string(record: &Record, pen: u32, id: u16) -> Option<String> {
    let (pos, _) = record.template().find_by_ident(pen, id, 0, 0)?;
    record.get(pos)?.as_str().map(str::to_string)
}

fn build(model: &InfoModel, idents: &[(u32, u16)], scope: usize) -> Result<Template> {
    let mut template = Template::new();
    for &(pen, id) in idents {
        template
            .append_by_id(model, pen, id, 0)
            .map_err(|e| Error::setup(format!("cannot build metadata template: {}", e)))?;
    }
    if scope > 0 {
        template
            .set_scope(scope)
            .map_err(|e| Error::setup(format!("cannot build metadata template: {}", e)))?;
    }
    Ok(template)
}

/// Options template for TemplateInfo records, scoped by `templateId`.
pub fn template_info_template(model: &InfoModel) -> Result<Template> {
    build(
        model,
        &[
            (IANA_PEN, TEMPLATE_ID),
            (CERT_PEN, PARENT_TEMPLATE_ID),
            (CERT_PEN, TEMPLATE_NAME),
            (CERT_PEN, TEMPLATE_DESCRIPTION),
            (CERT_PEN, TEMPLATE_ELEMENT_LIST),
        ],
        1,
    )
}

/// Template of the BasicListInfo records nested in TemplateInfo records.
pub fn basic_list_info_template(model: &InfoModel) -> Result<Template> {
    build(
        model,
        &[
            (IANA_PEN, ENTERPRISE_NUMBER),
            (IANA_PEN, ELEMENT_ID),
            (IANA_PEN, ENTERPRISE_NUMBER),
            (IANA_PEN, ELEMENT_ID),
        ],
        0,
    )
}

/// RFC 5610 element-type options template, scoped by enterprise and id.
pub fn element_type_template(model: &InfoModel) -> Result<Template> {
    build(
        model,
        &[
            (IANA_PEN, ENTERPRISE_NUMBER),
            (IANA_PEN, ELEMENT_ID),
            (IANA_PEN, ELEMENT_DATA_TYPE),
            (IANA_PEN, ELEMENT_SEMANTICS),
            (IANA_PEN, ELEMENT_UNITS),
            (IANA_PEN, ELEMENT_RANGE_BEGIN),
            (IANA_PEN, ELEMENT_RANGE_END),
            (IANA_PEN, ELEMENT_NAME),
            (IANA_PEN, ELEMENT_DESCRIPTION),
        ],
        2,
    )
}

/// Build a metadata template of the given kind.
pub fn metadata_template(model: &InfoModel, kind: MetadataKind) -> Result<Template> {
    match kind {
        MetadataKind::TemplateInfo => template_info_template(model),
        MetadataKind::BasicListInfo => basic_list_info_template(model),
        MetadataKind::ElementType => element_type_template(model),
    }
}

/// Recognize a received options template carrying metadata records.
pub fn classify(template: &Template) -> Option<MetadataKind> {
    if !template.is_options() {
        return None;
    }

    let has = |pen, id| template.find_by_ident(pen, id, 0, 0).is_some();
    if has(IANA_PEN, TEMPLATE_ID) && has(CERT_PEN, TEMPLATE_NAME) {
        Some(MetadataKind::TemplateInfo)
    } else if has(IANA_PEN, ELEMENT_ID)
        && has(IANA_PEN, ELEMENT_DATA_TYPE)
        && has(IANA_PEN, ELEMENT_NAME)
    {
        Some(MetadataKind::ElementType)
    } else {
        None
    }
}

/// Build the RFC 5610 record describing `element`.
pub fn element_to_record(element: &InfoElement, template: &Arc<Template>) -> Result<Record> {
    let mut record = Record::new(template.clone());
    set(&mut record, IANA_PEN, ENTERPRISE_NUMBER, 0, Value::Unsigned(u64::from(element.pen)))?;
    set(&mut record, IANA_PEN, ELEMENT_ID, 0, Value::Unsigned(u64::from(element.id)))?;
    set(
        &mut record,
        IANA_PEN,
        ELEMENT_DATA_TYPE,
        0,
        Value::Unsigned(u64::from(element.data_type.code())),
    )?;
    set(
        &mut record,
        IANA_PEN,
        ELEMENT_SEMANTICS,
        0,
        Value::Unsigned(element.semantics as u64),
    )?;
    set(&mut record, IANA_PEN, ELEMENT_UNITS, 0, Value::Unsigned(element.units as u64))?;
    set(&mut record, IANA_PEN, ELEMENT_RANGE_BEGIN, 0, Value::Unsigned(element.min))?;
    set(&mut record, IANA_PEN, ELEMENT_RANGE_END, 0, Value::Unsigned(element.max))?;
    set(&mut record, IANA_PEN, ELEMENT_NAME, 0, Value::String(&element.name))?;
    if let Some(description) = &element.description {
        set(&mut record, IANA_PEN, ELEMENT_DESCRIPTION, 0, Value::String(description))?;
    }
    Ok(record)
}

/// Read an RFC 5610 record back into an element definition.
pub fn element_from_record(record: &Record) -> Option<InfoElement> {
    let pen = u32::try_from(unsigned(record, IANA_PEN, ENTERPRISE_NUMBER, 0).unwrap_or(0)).ok()?;
    let id = u16::try_from(unsigned(record, IANA_PEN, ELEMENT_ID, 0)?).ok()?;
    let code = u8::try_from(unsigned(record, IANA_PEN, ELEMENT_DATA_TYPE, 0)?).ok()?;
    let data_type = DataType::from_code(code)?;
    let name = string(record, IANA_PEN, ELEMENT_NAME).filter(|n| !n.is_empty())?;

    let semantics = unsigned(record, IANA_PEN, ELEMENT_SEMANTICS, 0)
        .and_then(|s| u8::try_from(s).ok())
        .map(Semantics::from_code)
        .unwrap_or_default();
    let units = unsigned(record, IANA_PEN, ELEMENT_UNITS, 0)
        .and_then(|u| u16::try_from(u).ok())
        .map(Units::from_code)
        .unwrap_or_default();

    let mut element = InfoElement::new(name, pen, id, data_type)
        .with_semantics(semantics)
        .with_units(units)
        .with_range(
            unsigned(record, IANA_PEN, ELEMENT_RANGE_BEGIN, 0).unwrap_or(0),
            unsigned(record, IANA_PEN, ELEMENT_RANGE_END, 0).unwrap_or(0),
        );
    element.description = string(record, IANA_PEN, ELEMENT_DESCRIPTION).filter(|d| !d.is_empty());
    Some(element)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata_templates() {
        let model = InfoModel::with_defaults();

        let info = template_info_template(&model).unwrap();
        assert_eq!(info.scope_count(), 1);
        assert_eq!(classify(&info), Some(MetadataKind::TemplateInfo));

        let lists = basic_list_info_template(&model).unwrap();
        assert_eq!(lists.len(), 4);
        assert_eq!(lists.field(3).unwrap().midx(), 1);
        assert_eq!(classify(&lists), None);

        let types = element_type_template(&model).unwrap();
        assert_eq!(types.scope_count(), 2);
        assert_eq!(classify(&types), Some(MetadataKind::ElementType));
    }

    #[test]
    fn test_missing_elements_is_setup_error() {
        let model = InfoModel::new();
        assert!(matches!(
            template_info_template(&model),
            Err(Error::Setup(_))
        ));
    }

    #[test]
    fn test_template_info_record() {
        let model = InfoModel::with_defaults();
        let template = Arc::new(template_info_template(&model).unwrap());
        let lists = Arc::new(basic_list_info_template(&model).unwrap());

        let list_ie = model.lookup_by_name("basicList").unwrap();
        let port = model.lookup_by_name("destinationTransportPort").unwrap();
        let mut info = TemplateInfo::new("flows")
            .with_description("bidirectional flows")
            .with_parent(TemplateParent::Template(300));
        info.tid = 400;
        info.add_basic_list(&list_ie, &port);

        let record = info.to_record(&template, 512, &lists).unwrap();
        let stl = record.sub_template_list(4).unwrap();
        assert_eq!(stl.tid, 512);
        assert_eq!(stl.len(), 1);

        assert_eq!(TemplateInfo::from_record(&record), Some(info));
    }

    #[test]
    fn test_legacy_parent_is_unknown() {
        let model = InfoModel::with_defaults();
        let mut legacy = Template::new();
        legacy.append_by_id(&model, IANA_PEN, TEMPLATE_ID, 0).unwrap();
        legacy.append_by_id(&model, CERT_PEN, TEMPLATE_NAME, 0).unwrap();
        legacy.set_scope(1).unwrap();

        let mut record = Record::new(Arc::new(legacy));
        record.set(0, Value::Unsigned(300)).unwrap();
        record.set(1, Value::String("old")).unwrap();

        let info = TemplateInfo::from_record(&record).unwrap();
        assert_eq!(info.parent, TemplateParent::Unknown);
        assert_eq!(info.name, "old");
        assert!(info.lists.is_empty());

        let top = TemplateInfo::new("top");
        assert_eq!(top.parent, TemplateParent::TopLevel);
    }

    #[test]
    fn test_element_type_record() {
        let model = InfoModel::with_defaults();
        let template = Arc::new(element_type_template(&model).unwrap());

        let ie = InfoElement::new("widgetCount", 4242, 17, DataType::Unsigned32)
            .with_semantics(Semantics::TotalCounter)
            .with_units(Units::Packets)
            .with_range(1, 100)
            .with_description("Widgets seen");

        let record = element_to_record(&ie, &template).unwrap();
        assert_eq!(element_from_record(&record), Some(ie));
    }
}
