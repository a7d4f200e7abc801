//! Just enough DICOM to read an image header without its pixel data.

pub mod dictionary;
mod parser;
pub mod partial;
pub mod scrub;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

pub use parser::{parse_header, HeaderParseError, ParsedHeader};
pub use partial::PartialDicomReader;

/// A (group, element) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Tag(pub u16, pub u16);

impl Tag {
    pub const PIXEL_DATA: Tag = Tag(0x7FE0, 0x0010);
    pub const ITEM: Tag = Tag(0xFFFE, 0xE000);
    pub const ITEM_DELIMITATION: Tag = Tag(0xFFFE, 0xE00D);
    pub const SEQUENCE_DELIMITATION: Tag = Tag(0xFFFE, 0xE0DD);

    pub fn group(self) -> u16 {
        self.0
    }

    pub fn element(self) -> u16 {
        self.1
    }

    /// `GGGGEEEE`, the key form of the DICOM JSON model.
    pub fn json_key(self) -> String {
        format!("{:04X}{:04X}", self.0, self.1)
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:04X},{:04X})", self.0, self.1)
    }
}

pub mod tags {
    use super::Tag;

    pub const TRANSFER_SYNTAX_UID: Tag = Tag(0x0002, 0x0010);
    pub const SOP_INSTANCE_UID: Tag = Tag(0x0008, 0x0018);
    pub const MODALITY: Tag = Tag(0x0008, 0x0060);
    pub const PATIENT_NAME: Tag = Tag(0x0010, 0x0010);
    pub const PATIENT_ID: Tag = Tag(0x0010, 0x0020);
    pub const PATIENT_SEX: Tag = Tag(0x0010, 0x0040);
    pub const PATIENT_AGE: Tag = Tag(0x0010, 0x1010);
    pub const STUDY_INSTANCE_UID: Tag = Tag(0x0020, 0x000D);
    pub const SERIES_INSTANCE_UID: Tag = Tag(0x0020, 0x000E);
    pub const LUT_DATA: Tag = Tag(0x0028, 0x3006);
    pub const VOI_LUT_SEQUENCE: Tag = Tag(0x0028, 0x3010);
}

/// Value representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Vr {
    AE,
    AS,
    AT,
    CS,
    DA,
    DS,
    DT,
    FL,
    FD,
    IS,
    LO,
    LT,
    OB,
    OD,
    OF,
    OL,
    OV,
    OW,
    PN,
    SH,
    SL,
    SQ,
    SS,
    ST,
    SV,
    TM,
    UC,
    UI,
    UL,
    UN,
    UR,
    US,
    UT,
    UV,
}

impl Vr {
    pub fn from_bytes(bytes: [u8; 2]) -> Option<Self> {
        let vr = match &bytes {
            b"AE" => Self::AE,
            b"AS" => Self::AS,
            b"AT" => Self::AT,
            b"CS" => Self::CS,
            b"DA" => Self::DA,
            b"DS" => Self::DS,
            b"DT" => Self::DT,
            b"FL" => Self::FL,
            b"FD" => Self::FD,
            b"IS" => Self::IS,
            b"LO" => Self::LO,
            b"LT" => Self::LT,
            b"OB" => Self::OB,
            b"OD" => Self::OD,
            b"OF" => Self::OF,
            b"OL" => Self::OL,
            b"OV" => Self::OV,
            b"OW" => Self::OW,
            b"PN" => Self::PN,
            b"SH" => Self::SH,
            b"SL" => Self::SL,
            b"SQ" => Self::SQ,
            b"SS" => Self::SS,
            b"ST" => Self::ST,
            b"SV" => Self::SV,
            b"TM" => Self::TM,
            b"UC" => Self::UC,
            b"UI" => Self::UI,
            b"UL" => Self::UL,
            b"UN" => Self::UN,
            b"UR" => Self::UR,
            b"US" => Self::US,
            b"UT" => Self::UT,
            b"UV" => Self::UV,
            _ => return None,
        };
        Some(vr)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::AE => "AE",
            Self::AS => "AS",
            Self::AT => "AT",
            Self::CS => "CS",
            Self::DA => "DA",
            Self::DS => "DS",
            Self::DT => "DT",
            Self::FL => "FL",
            Self::FD => "FD",
            Self::IS => "IS",
            Self::LO => "LO",
            Self::LT => "LT",
            Self::OB => "OB",
            Self::OD => "OD",
            Self::OF => "OF",
            Self::OL => "OL",
            Self::OV => "OV",
            Self::OW => "OW",
            Self::PN => "PN",
            Self::SH => "SH",
            Self::SL => "SL",
            Self::SQ => "SQ",
            Self::SS => "SS",
            Self::ST => "ST",
            Self::SV => "SV",
            Self::TM => "TM",
            Self::UC => "UC",
            Self::UI => "UI",
            Self::UL => "UL",
            Self::UN => "UN",
            Self::UR => "UR",
            Self::US => "US",
            Self::UT => "UT",
            Self::UV => "UV",
        }
    }

    /// VRs encoded with a 4-byte length in explicit VR syntaxes.
    pub fn has_long_length(self) -> bool {
        matches!(
            self,
            Self::OB
                | Self::OD
                | Self::OF
                | Self::OL
                | Self::OV
                | Self::OW
                | Self::SQ
                | Self::SV
                | Self::UC
                | Self::UN
                | Self::UR
                | Self::UT
                | Self::UV
        )
    }

    /// VRs whose JSON form is `InlineBinary`.
    pub fn is_binary(self) -> bool {
        matches!(
            self,
            Self::OB | Self::OD | Self::OF | Self::OL | Self::OV | Self::OW | Self::UN
        )
    }

    /// Text VRs that never hold more than one value.
    fn is_single_valued_text(self) -> bool {
        matches!(self, Self::LT | Self::ST | Self::UT | Self::UR)
    }
}

impl fmt::Display for Vr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Text(Vec<String>),
    Int(Vec<i64>),
    Float(Vec<f64>),
    Tags(Vec<Tag>),
    Binary(Vec<u8>),
    Sequence(Vec<DataSet>),
    /// Removed by the scrubber.
    Null,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Element {
    pub vr: Vr,
    pub value: Value,
}

/// Elements keyed by tag, in tag order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DataSet {
    elements: BTreeMap<Tag, Element>,
}

impl DataSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, tag: Tag, element: Element) {
        self.elements.insert(tag, element);
    }

    pub fn get(&self, tag: Tag) -> Option<&Element> {
        self.elements.get(&tag)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Tag, &Element)> {
        self.elements.iter()
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// First non-empty text value of `tag`.
    pub fn string(&self, tag: Tag) -> Option<&str> {
        match &self.get(tag)?.value {
            Value::Text(values) => values
                .iter()
                .map(|v| v.trim())
                .find(|v| !v.is_empty()),
            _ => None,
        }
    }

    /// Every tag in the data set, including those nested in sequences.
    pub fn tag_set(&self) -> BTreeSet<Tag> {
        let mut tags = BTreeSet::new();
        self.collect_tags(&mut tags);
        tags
    }

    fn collect_tags(&self, into: &mut BTreeSet<Tag>) {
        for (tag, element) in &self.elements {
            into.insert(*tag);
            if let Value::Sequence(items) = &element.value {
                for item in items {
                    item.collect_tags(into);
                }
            }
        }
    }
}

/// File meta information plus the data set up to the pixel data.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DicomHeader {
    pub meta: DataSet,
    pub dataset: DataSet,
}

impl DicomHeader {
    pub fn tag_set(&self) -> BTreeSet<Tag> {
        let mut tags = self.meta.tag_set();
        tags.extend(self.dataset.tag_set());
        tags
    }

    pub fn patient_id(&self) -> Option<&str> {
        self.dataset.string(tags::PATIENT_ID)
    }

    pub fn study_instance_uid(&self) -> Option<&str> {
        self.dataset.string(tags::STUDY_INSTANCE_UID)
    }

    pub fn series_instance_uid(&self) -> Option<&str> {
        self.dataset.string(tags::SERIES_INSTANCE_UID)
    }

    pub fn modality(&self) -> Option<&str> {
        self.dataset.string(tags::MODALITY)
    }
}
