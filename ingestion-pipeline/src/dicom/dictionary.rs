use dicom_core::{
    dictionary::{DataDictionary, DataDictionaryEntry, VirtualVr},
    VR,
};
use dicom_dictionary_std::StandardDataDictionary;

use super::{Tag, Vr};

/// VR of a tag in implicit VR transfer syntaxes, from the standard data
/// dictionary. Private and unknown tags decode as `UN`.
pub fn implicit_vr(tag: Tag) -> Vr {
    if tag.element() == 0x0000 {
        return Vr::UL;
    }
    let Some(entry) = StandardDataDictionary.by_tag(dicom_core::Tag(tag.group(), tag.element()))
    else {
        return Vr::UN;
    };
    let vr = match entry.vr() {
        VirtualVr::Exact(vr) => vr,
        // US or SS depending on pixel representation; the unsigned reading keeps the value.
        VirtualVr::Xs => VR::US,
        _ => VR::OW,
    };
    from_standard(vr)
}

fn from_standard(vr: VR) -> Vr {
    let code = vr.to_string();
    <[u8; 2]>::try_from(code.as_bytes())
        .ok()
        .and_then(Vr::from_bytes)
        .unwrap_or(Vr::UN)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dicom::tags;

    #[test]
    fn resolves_known_and_unknown_tags() {
        assert_eq!(implicit_vr(tags::PATIENT_ID), Vr::LO);
        assert_eq!(implicit_vr(tags::VOI_LUT_SEQUENCE), Vr::SQ);
        assert_eq!(implicit_vr(Tag(0x0028, 0x0000)), Vr::UL);
        assert_eq!(implicit_vr(Tag(0x0009, 0x1010)), Vr::UN);
    }

    #[test]
    fn covers_attributes_the_pipeline_never_reads() {
        assert_eq!(implicit_vr(Tag(0x0018, 0x5101)), Vr::CS);
        assert_eq!(implicit_vr(Tag(0x0008, 0x0005)), Vr::CS);
        assert_eq!(implicit_vr(Tag(0x0028, 0x0008)), Vr::IS);
        assert_eq!(implicit_vr(Tag(0x0008, 0x1140)), Vr::SQ);
        assert_eq!(implicit_vr(Tag(0x0008, 0x1155)), Vr::UI);
        assert_eq!(implicit_vr(Tag(0x0028, 0x3002)), Vr::US);
    }
}
