//! pg_dump archive table-of-contents parsing
//!
//! The restore-list path reads the text form of an archive TOC (one object
//! per line) to build filtered restore lists. A line is
//!
//! ```text
//! <dumpId>; <catalogOid> <objectOid> <desc> <rest>
//! ```
//!
//! Lines starting with `;` and blank lines are comments. Descriptions are
//! matched longest-first so `MATERIALIZED VIEW DATA` wins over
//! `MATERIALIZED VIEW` no matter how the table is ordered. For `ACL` and
//! `COMMENT` entries the rest is a composite `- <subdesc> <qualified name>`;
//! `SCHEMA` and `EXTENSION` subdescriptors get dedicated restore-list names,
//! everything else is passed through.

use crate::errors::{CdcError, CdcResult};

/// Object kind of one TOC entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveObjectKind {
    AccessMethod,
    Acl,
    Aggregate,
    Blob,
    Cast,
    CheckConstraint,
    Collation,
    Comment,
    Constraint,
    Conversion,
    Database,
    Default,
    DefaultAcl,
    Domain,
    EventTrigger,
    Extension,
    FkConstraint,
    ForeignDataWrapper,
    ForeignServer,
    ForeignTable,
    Function,
    Index,
    IndexAttach,
    LargeObject,
    MaterializedView,
    MaterializedViewData,
    OperatorClass,
    OperatorFamily,
    Operator,
    Policy,
    Procedure,
    Publication,
    PublicationTable,
    RowSecurity,
    Rule,
    Schema,
    Sequence,
    SequenceOwnedBy,
    SequenceSet,
    Statistics,
    Subscription,
    Table,
    TableAttach,
    TableData,
    TextSearchConfiguration,
    TextSearchDictionary,
    TextSearchParser,
    TextSearchTemplate,
    Trigger,
    Type,
    UserMapping,
    View,
}

/// Description strings paired with their kind. Lookup sorts candidates by
/// length, so insertion order here carries no meaning.
const DESCRIPTIONS: &[(&str, ArchiveObjectKind)] = &[
    ("ACCESS METHOD", ArchiveObjectKind::AccessMethod),
    ("ACL", ArchiveObjectKind::Acl),
    ("AGGREGATE", ArchiveObjectKind::Aggregate),
    ("BLOB", ArchiveObjectKind::Blob),
    ("CAST", ArchiveObjectKind::Cast),
    ("CHECK CONSTRAINT", ArchiveObjectKind::CheckConstraint),
    ("COLLATION", ArchiveObjectKind::Collation),
    ("COMMENT", ArchiveObjectKind::Comment),
    ("CONSTRAINT", ArchiveObjectKind::Constraint),
    ("CONVERSION", ArchiveObjectKind::Conversion),
    ("DATABASE", ArchiveObjectKind::Database),
    ("DEFAULT", ArchiveObjectKind::Default),
    ("DEFAULT ACL", ArchiveObjectKind::DefaultAcl),
    ("DOMAIN", ArchiveObjectKind::Domain),
    ("EVENT TRIGGER", ArchiveObjectKind::EventTrigger),
    ("EXTENSION", ArchiveObjectKind::Extension),
    ("FK CONSTRAINT", ArchiveObjectKind::FkConstraint),
    ("FOREIGN DATA WRAPPER", ArchiveObjectKind::ForeignDataWrapper),
    ("SERVER", ArchiveObjectKind::ForeignServer),
    ("FOREIGN TABLE", ArchiveObjectKind::ForeignTable),
    ("FUNCTION", ArchiveObjectKind::Function),
    ("INDEX", ArchiveObjectKind::Index),
    ("INDEX ATTACH", ArchiveObjectKind::IndexAttach),
    ("LARGE OBJECT", ArchiveObjectKind::LargeObject),
    ("MATERIALIZED VIEW", ArchiveObjectKind::MaterializedView),
    ("MATERIALIZED VIEW DATA", ArchiveObjectKind::MaterializedViewData),
    ("OPERATOR CLASS", ArchiveObjectKind::OperatorClass),
    ("OPERATOR FAMILY", ArchiveObjectKind::OperatorFamily),
    ("OPERATOR", ArchiveObjectKind::Operator),
    ("POLICY", ArchiveObjectKind::Policy),
    ("PROCEDURE", ArchiveObjectKind::Procedure),
    ("PUBLICATION", ArchiveObjectKind::Publication),
    ("PUBLICATION TABLE", ArchiveObjectKind::PublicationTable),
    ("ROW SECURITY", ArchiveObjectKind::RowSecurity),
    ("RULE", ArchiveObjectKind::Rule),
    ("SCHEMA", ArchiveObjectKind::Schema),
    ("SEQUENCE", ArchiveObjectKind::Sequence),
    ("SEQUENCE OWNED BY", ArchiveObjectKind::SequenceOwnedBy),
    ("SEQUENCE SET", ArchiveObjectKind::SequenceSet),
    ("STATISTICS", ArchiveObjectKind::Statistics),
    ("SUBSCRIPTION", ArchiveObjectKind::Subscription),
    ("TABLE", ArchiveObjectKind::Table),
    ("TABLE ATTACH", ArchiveObjectKind::TableAttach),
    ("TABLE DATA", ArchiveObjectKind::TableData),
    (
        "TEXT SEARCH CONFIGURATION",
        ArchiveObjectKind::TextSearchConfiguration,
    ),
    (
        "TEXT SEARCH DICTIONARY",
        ArchiveObjectKind::TextSearchDictionary,
    ),
    ("TEXT SEARCH PARSER", ArchiveObjectKind::TextSearchParser),
    ("TEXT SEARCH TEMPLATE", ArchiveObjectKind::TextSearchTemplate),
    ("TRIGGER", ArchiveObjectKind::Trigger),
    ("TYPE", ArchiveObjectKind::Type),
    ("USER MAPPING", ArchiveObjectKind::UserMapping),
    ("VIEW", ArchiveObjectKind::View),
];

/// Subdescriptor of a composite (ACL/COMMENT) entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveTagKind {
    Schema,
    Extension,
    Other,
}

/// One parsed TOC entry
#[derive(Debug, Clone, PartialEq)]
pub struct ArchiveTocEntry {
    pub dump_id: u32,
    pub catalog_oid: u32,
    pub object_oid: u32,
    pub desc: ArchiveObjectKind,
    pub tag_kind: ArchiveTagKind,
    pub is_composite_tag: bool,
    pub restore_list_name: String,
}

/// Match the longest description that prefixes `rest`, returning the kind
/// and what follows the description (leading space stripped).
fn match_description(rest: &str) -> Option<(ArchiveObjectKind, &str)> {
    let mut best: Option<(&str, ArchiveObjectKind)> = None;
    for &(desc, kind) in DESCRIPTIONS {
        let matches = rest == desc
            || (rest.starts_with(desc) && rest.as_bytes().get(desc.len()) == Some(&b' '));
        if matches && best.is_none_or(|(b, _)| desc.len() > b.len()) {
            best = Some((desc, kind));
        }
    }
    best.map(|(desc, kind)| (kind, rest[desc.len()..].trim_start()))
}

/// Parse one TOC line. Comments and blank lines yield `None`.
pub fn parse_toc_line(line: &str) -> CdcResult<Option<ArchiveTocEntry>> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with(';') {
        return Ok(None);
    }

    let (dump_id, rest) = trimmed
        .split_once(';')
        .ok_or_else(|| CdcError::parse_with_context("TOC line is missing the dump id", line))?;
    let dump_id: u32 = dump_id
        .trim()
        .parse()
        .map_err(|_| CdcError::parse_with_context("Invalid TOC dump id", line))?;

    let mut fields = rest.trim_start().splitn(3, ' ');
    let catalog_oid: u32 = fields
        .next()
        .and_then(|f| f.parse().ok())
        .ok_or_else(|| CdcError::parse_with_context("Invalid TOC catalog OID", line))?;
    let object_oid: u32 = fields
        .next()
        .and_then(|f| f.parse().ok())
        .ok_or_else(|| CdcError::parse_with_context("Invalid TOC object OID", line))?;
    let tail = fields.next().unwrap_or("");

    let (desc, rest) = match_description(tail)
        .ok_or_else(|| CdcError::parse_with_context("Unknown TOC description", line))?;

    let is_composite = matches!(desc, ArchiveObjectKind::Acl | ArchiveObjectKind::Comment);

    let (tag_kind, restore_list_name) = if is_composite {
        let composite = rest.strip_prefix("- ").ok_or_else(|| {
            CdcError::parse_with_context("Composite TOC entry is missing the '- ' marker", line)
        })?;

        if let Some(name) = composite.strip_prefix("SCHEMA ") {
            // restore list name keeps the composite marker: `- nspname rolname`
            (ArchiveTagKind::Schema, format!("- {}", name))
        } else if let Some(name) = composite.strip_prefix("EXTENSION ") {
            let name = name.split(' ').next().unwrap_or(name);
            (ArchiveTagKind::Extension, name.to_string())
        } else {
            (ArchiveTagKind::Other, rest.to_string())
        }
    } else {
        (ArchiveTagKind::Other, rest.to_string())
    };

    Ok(Some(ArchiveTocEntry {
        dump_id,
        catalog_oid,
        object_oid,
        desc,
        tag_kind,
        is_composite_tag: is_composite,
        restore_list_name,
    }))
}
