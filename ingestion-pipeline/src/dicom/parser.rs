use thiserror::Error;

use super::{dictionary::implicit_vr, tags, DataSet, DicomHeader, Element, Tag, Value, Vr};

const PREAMBLE_LEN: usize = 128;
const MAGIC: &[u8; 4] = b"DICM";
const UNDEFINED_LENGTH: u32 = 0xFFFF_FFFF;
const META_GROUP: u16 = 0x0002;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HeaderParseError {
    /// The buffer ended in the middle of an element.
    #[error("data ends at byte {offset} in the middle of an element")]
    Truncated { offset: usize },
    #[error("missing DICM prefix")]
    NotDicom,
    #[error("unsupported transfer syntax {0}")]
    UnsupportedTransferSyntax(String),
    #[error("malformed element at byte {offset}: {reason}")]
    Malformed { offset: usize, reason: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedHeader {
    pub header: DicomHeader,
    /// Whether parsing stopped at the top-level pixel data element.
    pub reached_pixel_data: bool,
}

#[derive(Debug, Clone, Copy)]
struct Syntax {
    explicit_vr: bool,
    big_endian: bool,
}

impl Syntax {
    const EXPLICIT_LE: Syntax = Syntax {
        explicit_vr: true,
        big_endian: false,
    };
    const IMPLICIT_LE: Syntax = Syntax {
        explicit_vr: false,
        big_endian: false,
    };

    fn from_uid(uid: &str) -> Result<Self, HeaderParseError> {
        match uid {
            "1.2.840.10008.1.2" => Ok(Self::IMPLICIT_LE),
            "1.2.840.10008.1.2.2" => Ok(Syntax {
                explicit_vr: true,
                big_endian: true,
            }),
            "1.2.840.10008.1.2.1.99" => {
                Err(HeaderParseError::UnsupportedTransferSyntax(uid.to_string()))
            }
            // Explicit little endian and every encapsulated syntax share the
            // same header encoding.
            uid if uid.starts_with("1.2.840.10008.1.2.") => Ok(Self::EXPLICIT_LE),
            other => Err(HeaderParseError::UnsupportedTransferSyntax(other.to_string())),
        }
    }
}

/// Parse the file meta group and the data set up to the pixel data element.
///
/// `data` may be a prefix of the file. A buffer that ends between two
/// top-level elements parses successfully; one that ends inside an element
/// fails with [`HeaderParseError::Truncated`].
pub fn parse_header(data: &[u8]) -> Result<ParsedHeader, HeaderParseError> {
    let mut cursor = Cursor::new(data);
    cursor.skip(PREAMBLE_LEN)?;
    if cursor.take(MAGIC.len())? != MAGIC {
        return Err(HeaderParseError::NotDicom);
    }

    let mut meta = DataSet::new();
    while let Some(group) = cursor.peek_group(false)? {
        if group != META_GROUP {
            break;
        }
        let (tag, element) = cursor.read_element(Syntax::EXPLICIT_LE)?;
        meta.insert(tag, element);
    }

    let syntax = match meta.string(tags::TRANSFER_SYNTAX_UID) {
        Some(uid) => Syntax::from_uid(uid.trim_end_matches('\0'))?,
        None => Syntax::IMPLICIT_LE,
    };

    let (dataset, reached_pixel_data) = cursor.read_top_level(syntax)?;
    Ok(ParsedHeader {
        header: DicomHeader { meta, dataset },
        reached_pixel_data,
    })
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn malformed(&self, reason: impl Into<String>) -> HeaderParseError {
        HeaderParseError::Malformed {
            offset: self.pos,
            reason: reason.into(),
        }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.data.len()
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], HeaderParseError> {
        let end = self
            .pos
            .checked_add(len)
            .ok_or_else(|| self.malformed("length overflows"))?;
        let bytes = self
            .data
            .get(self.pos..end)
            .ok_or(HeaderParseError::Truncated { offset: self.data.len() })?;
        self.pos = end;
        Ok(bytes)
    }

    fn skip(&mut self, len: usize) -> Result<(), HeaderParseError> {
        self.take(len).map(|_| ())
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], HeaderParseError> {
        let bytes = self.take(N)?;
        <[u8; N]>::try_from(bytes).map_err(|_| self.malformed("short read"))
    }

    fn u16(&mut self, big_endian: bool) -> Result<u16, HeaderParseError> {
        let bytes = self.array::<2>()?;
        Ok(if big_endian {
            u16::from_be_bytes(bytes)
        } else {
            u16::from_le_bytes(bytes)
        })
    }

    fn u32(&mut self, big_endian: bool) -> Result<u32, HeaderParseError> {
        let bytes = self.array::<4>()?;
        Ok(if big_endian {
            u32::from_be_bytes(bytes)
        } else {
            u32::from_le_bytes(bytes)
        })
    }

    fn tag(&mut self, big_endian: bool) -> Result<Tag, HeaderParseError> {
        let group = self.u16(big_endian)?;
        let element = self.u16(big_endian)?;
        Ok(Tag(group, element))
    }

    /// Group of the next element, or `None` at the end of the buffer.
    fn peek_group(&self, big_endian: bool) -> Result<Option<u16>, HeaderParseError> {
        if self.at_end() {
            return Ok(None);
        }
        let mut ahead = Cursor {
            data: self.data,
            pos: self.pos,
        };
        ahead.u16(big_endian).map(Some)
    }

    fn read_top_level(&mut self, syntax: Syntax) -> Result<(DataSet, bool), HeaderParseError> {
        let mut dataset = DataSet::new();
        while !self.at_end() {
            let start = self.pos;
            let tag = self.tag(syntax.big_endian)?;
            if tag == Tag::PIXEL_DATA {
                self.pos = start;
                return Ok((dataset, true));
            }
            self.pos = start;
            let (tag, element) = self.read_element(syntax)?;
            dataset.insert(tag, element);
        }
        Ok((dataset, false))
    }

    fn read_element(&mut self, syntax: Syntax) -> Result<(Tag, Element), HeaderParseError> {
        let tag = self.tag(syntax.big_endian)?;
        if tag.group() == 0xFFFE {
            return Err(self.malformed(format!("unexpected delimiter {tag}")));
        }

        let (vr, length) = if syntax.explicit_vr {
            let code = self.array::<2>()?;
            let vr = Vr::from_bytes(code)
                .ok_or_else(|| self.malformed(format!("unknown VR for {tag}")))?;
            let length = if vr.has_long_length() {
                self.skip(2)?;
                self.u32(syntax.big_endian)?
            } else {
                u32::from(self.u16(syntax.big_endian)?)
            };
            (vr, length)
        } else {
            (implicit_vr(tag), self.u32(syntax.big_endian)?)
        };

        let value = if length == UNDEFINED_LENGTH {
            match vr {
                Vr::SQ => Value::Sequence(self.read_items(syntax, None)?),
                // Undefined length UN holds an implicit little endian sequence.
                Vr::UN => Value::Sequence(self.read_items(Syntax::IMPLICIT_LE, None)?),
                vr if vr.is_binary() => Value::Binary(self.read_fragments()?),
                _ => return Err(self.malformed(format!("undefined length on {vr} {tag}"))),
            }
        } else {
            let length = usize::try_from(length).map_err(|_| self.malformed("length"))?;
            if vr == Vr::SQ {
                Value::Sequence(self.read_items(syntax, Some(length))?)
            } else {
                decode(vr, self.take(length)?, syntax.big_endian)
            }
        };
        Ok((tag, Element { vr, value }))
    }

    /// Items of a sequence, either `length` bytes long or up to the sequence
    /// delimiter.
    fn read_items(
        &mut self,
        syntax: Syntax,
        length: Option<usize>,
    ) -> Result<Vec<DataSet>, HeaderParseError> {
        let end = match length {
            Some(length) => Some(
                self.pos
                    .checked_add(length)
                    .ok_or_else(|| self.malformed("sequence length overflows"))?,
            ),
            None => None,
        };

        let mut items = Vec::new();
        loop {
            if end.is_some_and(|end| self.pos >= end) {
                break;
            }
            let tag = self.tag(syntax.big_endian)?;
            let item_length = self.u32(syntax.big_endian)?;
            match tag {
                Tag::ITEM => {
                    let item_end = if item_length == UNDEFINED_LENGTH {
                        None
                    } else {
                        let len = usize::try_from(item_length)
                            .map_err(|_| self.malformed("item length"))?;
                        Some(
                            self.pos
                                .checked_add(len)
                                .ok_or_else(|| self.malformed("item length overflows"))?,
                        )
                    };
                    items.push(self.read_item(syntax, item_end)?);
                }
                Tag::SEQUENCE_DELIMITATION if end.is_none() => break,
                other => return Err(self.malformed(format!("expected item, found {other}"))),
            }
        }
        Ok(items)
    }

    fn read_item(&mut self, syntax: Syntax, end: Option<usize>) -> Result<DataSet, HeaderParseError> {
        let mut item = DataSet::new();
        loop {
            match end {
                Some(end) if self.pos >= end => break,
                Some(_) => {}
                None => {
                    let start = self.pos;
                    if self.tag(syntax.big_endian)? == Tag::ITEM_DELIMITATION {
                        self.skip(4)?;
                        break;
                    }
                    self.pos = start;
                }
            }
            let (tag, element) = self.read_element(syntax)?;
            item.insert(tag, element);
        }
        Ok(item)
    }

    /// Encapsulated fragments, concatenated.
    fn read_fragments(&mut self) -> Result<Vec<u8>, HeaderParseError> {
        let mut bytes = Vec::new();
        loop {
            let tag = self.tag(false)?;
            let length = self.u32(false)?;
            match tag {
                Tag::ITEM => {
                    let length =
                        usize::try_from(length).map_err(|_| self.malformed("fragment length"))?;
                    bytes.extend_from_slice(self.take(length)?);
                }
                Tag::SEQUENCE_DELIMITATION => return Ok(bytes),
                other => {
                    return Err(self.malformed(format!("expected fragment, found {other}")))
                }
            }
        }
    }
}

fn decode(vr: Vr, bytes: &[u8], big_endian: bool) -> Value {
    match vr {
        Vr::US => Value::Int(numbers(bytes, |b| i64::from(endian_u16(b, big_endian)))),
        Vr::SS => Value::Int(numbers(bytes, |b| {
            i64::from(if big_endian {
                i16::from_be_bytes(b)
            } else {
                i16::from_le_bytes(b)
            })
        })),
        Vr::UL => Value::Int(numbers(bytes, |b| {
            i64::from(if big_endian {
                u32::from_be_bytes(b)
            } else {
                u32::from_le_bytes(b)
            })
        })),
        Vr::SL => Value::Int(numbers(bytes, |b| {
            i64::from(if big_endian {
                i32::from_be_bytes(b)
            } else {
                i32::from_le_bytes(b)
            })
        })),
        Vr::SV => Value::Int(numbers(bytes, |b| {
            if big_endian {
                i64::from_be_bytes(b)
            } else {
                i64::from_le_bytes(b)
            }
        })),
        Vr::UV => Value::Int(numbers(bytes, |b| {
            let value = if big_endian {
                u64::from_be_bytes(b)
            } else {
                u64::from_le_bytes(b)
            };
            i64::try_from(value).unwrap_or(i64::MAX)
        })),
        Vr::FL => Value::Float(numbers(bytes, |b| {
            f64::from(if big_endian {
                f32::from_be_bytes(b)
            } else {
                f32::from_le_bytes(b)
            })
        })),
        Vr::FD => Value::Float(numbers(bytes, |b| {
            if big_endian {
                f64::from_be_bytes(b)
            } else {
                f64::from_le_bytes(b)
            }
        })),
        Vr::AT => {
            let halves: Vec<u16> = numbers(bytes, |b| endian_u16(b, big_endian));
            Value::Tags(
                halves
                    .chunks_exact(2)
                    .filter_map(|pair| match pair {
                        [group, element] => Some(Tag(*group, *element)),
                        _ => None,
                    })
                    .collect(),
            )
        }
        vr if vr.is_binary() => Value::Binary(bytes.to_vec()),
        vr => Value::Text(text_values(vr, bytes)),
    }
}

fn endian_u16(bytes: [u8; 2], big_endian: bool) -> u16 {
    if big_endian {
        u16::from_be_bytes(bytes)
    } else {
        u16::from_le_bytes(bytes)
    }
}

fn numbers<const N: usize, T>(bytes: &[u8], decode: impl Fn([u8; N]) -> T) -> Vec<T> {
    bytes
        .chunks_exact(N)
        .filter_map(|chunk| <[u8; N]>::try_from(chunk).ok())
        .map(decode)
        .collect()
}

fn text_values(vr: Vr, bytes: &[u8]) -> Vec<String> {
    let text = String::from_utf8_lossy(bytes);
    let text = text.trim_end_matches(['\0', ' ']);
    if text.is_empty() {
        return Vec::new();
    }
    if vr.is_single_valued_text() {
        return vec![text.to_string()];
    }
    text.split('\\')
        .map(|value| value.trim_matches([' ', '\0']).to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dicom::testing::{sample_image, DicomBuilder};

    #[test]
    fn parses_explicit_header_up_to_pixel_data() {
        let file = sample_image("Covid10", false, 100);
        let parsed = parse_header(&file).expect("parse");

        assert!(parsed.reached_pixel_data);
        let header = &parsed.header;
        assert_eq!(header.patient_id(), Some("Covid10"));
        assert_eq!(header.modality(), Some("DX"));
        assert_eq!(header.study_instance_uid(), Some("1.2.3"));
        assert_eq!(header.series_instance_uid(), Some("1.2.3.4"));
        assert!(header.dataset.get(Tag::PIXEL_DATA).is_none());
        assert_eq!(
            header.dataset.get(Tag(0x0028, 0x0010)).map(|e| &e.value),
            Some(&Value::Int(vec![512]))
        );

        let voi = header
            .dataset
            .get(tags::VOI_LUT_SEQUENCE)
            .expect("voi lut sequence");
        match &voi.value {
            Value::Sequence(items) => {
                assert_eq!(items.len(), 1);
                assert!(items.first().and_then(|i| i.get(tags::LUT_DATA)).is_some());
            }
            other => panic!("expected a sequence, got {other:?}"),
        }
    }

    #[test]
    fn parses_implicit_header_with_dictionary() {
        let file = sample_image("Covid11", true, 100);
        let parsed = parse_header(&file).expect("parse");
        assert!(parsed.reached_pixel_data);
        assert_eq!(parsed.header.patient_id(), Some("Covid11"));
        assert_eq!(
            parsed.header.dataset.get(tags::PATIENT_NAME).map(|e| e.vr),
            Some(Vr::PN)
        );
        assert_eq!(
            parsed.header.dataset.get(Tag(0x0009, 0x1010)).map(|e| e.vr),
            Some(Vr::UN)
        );
        assert!(parsed.header.tag_set().contains(&tags::LUT_DATA));
    }

    #[test]
    fn defined_length_sequences_parse_like_undefined_ones() {
        let item = || DicomBuilder::explicit().text(Tag(0x0028, 0x3003), b"LO", "window");
        let defined = DicomBuilder::explicit()
            .sequence(tags::VOI_LUT_SEQUENCE, vec![item(), item()], false)
            .file();
        let undefined = DicomBuilder::explicit()
            .sequence(tags::VOI_LUT_SEQUENCE, vec![item(), item()], true)
            .file();
        let defined = parse_header(&defined).expect("defined");
        let undefined = parse_header(&undefined).expect("undefined");
        assert_eq!(defined.header.dataset, undefined.header.dataset);
        assert!(!defined.reached_pixel_data);
    }

    #[test]
    fn splits_multi_valued_text() {
        let file = DicomBuilder::explicit()
            .text(Tag(0x0008, 0x0008), b"CS", "ORIGINAL\\PRIMARY")
            .text(Tag(0x0028, 0x0030), b"DS", " 0.139\\0.139")
            .file();
        let parsed = parse_header(&file).expect("parse");
        assert_eq!(
            parsed.header.dataset.get(Tag(0x0008, 0x0008)).map(|e| &e.value),
            Some(&Value::Text(vec!["ORIGINAL".into(), "PRIMARY".into()]))
        );
        assert_eq!(
            parsed.header.dataset.get(Tag(0x0028, 0x0030)).map(|e| &e.value),
            Some(&Value::Text(vec!["0.139".into(), "0.139".into()]))
        );
    }

    #[test]
    fn prefix_ending_mid_element_is_truncated() {
        let file = sample_image("Covid10", false, 4000);
        // Cut inside the large private element.
        let err = parse_header(file.get(..1024).expect("prefix")).expect_err("truncated");
        assert!(matches!(err, HeaderParseError::Truncated { .. }));

        let err = parse_header(file.get(..100).expect("prefix")).expect_err("truncated");
        assert!(matches!(err, HeaderParseError::Truncated { .. }));
    }

    #[test]
    fn rejects_files_without_magic() {
        let mut file = sample_image("Covid10", false, 10);
        if let Some(byte) = file.get_mut(128) {
            *byte = b'X';
        }
        assert_eq!(parse_header(&file), Err(HeaderParseError::NotDicom));
    }

    #[test]
    fn rejects_deflated_syntax() {
        assert!(matches!(
            Syntax::from_uid("1.2.840.10008.1.2.1.99"),
            Err(HeaderParseError::UnsupportedTransferSyntax(_))
        ));
        assert!(Syntax::from_uid("1.2.840.10008.1.2.4.50").is_ok());
        assert!(Syntax::from_uid("1.2.3").is_err());
    }
}
