// src/engine/profile.rs
//
// Compact ICC v2 profiles used by optimize_icc_profile. Built once, on first
// use.

use once_cell::sync::Lazy;

/// Profiles the engine can substitute for an embedded one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ProfileId {
    /// sRGB primaries, gamma 2.2 tone curve
    Srgb,
    /// Grey with a gamma 2.2 tone curve
    Sgray,
}

impl ProfileId {
    pub fn name(&self) -> &'static str {
        match self {
            ProfileId::Srgb => "srgb",
            ProfileId::Sgray => "sgray",
        }
    }

    /// The profile bytes.
    pub fn bytes(&self) -> &'static [u8] {
        match self {
            ProfileId::Srgb => SRGB.as_slice(),
            ProfileId::Sgray => SGRAY.as_slice(),
        }
    }
}

static SRGB: Lazy<Vec<u8>> = Lazy::new(|| {
    build_profile(
        b"RGB ",
        "Compact sRGB",
        &[
            (*b"rXYZ", xyz_tag([0.4361, 0.2225, 0.0139])),
            (*b"gXYZ", xyz_tag([0.3851, 0.7169, 0.0971])),
            (*b"bXYZ", xyz_tag([0.1431, 0.0606, 0.7141])),
            (*b"rTRC", gamma_tag(2.2)),
            (*b"gTRC", gamma_tag(2.2)),
            (*b"bTRC", gamma_tag(2.2)),
        ],
    )
});

static SGRAY: Lazy<Vec<u8>> =
    Lazy::new(|| build_profile(b"GRAY", "Compact sGray", &[(*b"kTRC", gamma_tag(2.2))]));

const D50: [f64; 3] = [0.9642, 1.0, 0.8249];

fn s15_fixed16(v: f64) -> [u8; 4] {
    ((v * 65536.0).round() as i32).to_be_bytes()
}

fn xyz_tag(xyz: [f64; 3]) -> Vec<u8> {
    let mut out = b"XYZ \0\0\0\0".to_vec();
    for v in xyz {
        out.extend_from_slice(&s15_fixed16(v));
    }
    out
}

fn gamma_tag(gamma: f64) -> Vec<u8> {
    let mut out = b"curv\0\0\0\0".to_vec();
    out.extend_from_slice(&1u32.to_be_bytes());
    // u8Fixed8Number
    out.extend_from_slice(&((gamma * 256.0).round() as u16).to_be_bytes());
    out
}

fn desc_tag(text: &str) -> Vec<u8> {
    let mut out = b"desc\0\0\0\0".to_vec();
    out.extend_from_slice(&(text.len() as u32 + 1).to_be_bytes());
    out.extend_from_slice(text.as_bytes());
    out.push(0);
    // empty Unicode and ScriptCode descriptions
    out.extend_from_slice(&[0u8; 4 + 4 + 2 + 1 + 67]);
    out
}

fn build_profile(colour_space: &[u8; 4], description: &str, extra: &[([u8; 4], Vec<u8>)]) -> Vec<u8> {
    let mut tags: Vec<([u8; 4], Vec<u8>)> = vec![
        (*b"desc", desc_tag(description)),
        (*b"wtpt", xyz_tag(D50)),
        (*b"cprt", {
            let mut t = b"text\0\0\0\0".to_vec();
            t.extend_from_slice(b"No copyright, use freely\0");
            t
        }),
    ];
    tags.extend(extra.iter().cloned());

    let table_len = 4 + tags.len() * 12;
    let mut offset = 128 + table_len;
    let mut table = Vec::with_capacity(table_len);
    let mut data = Vec::new();
    table.extend_from_slice(&(tags.len() as u32).to_be_bytes());
    for (signature, body) in &tags {
        while offset % 4 != 0 {
            data.push(0);
            offset += 1;
        }
        table.extend_from_slice(signature);
        table.extend_from_slice(&(offset as u32).to_be_bytes());
        table.extend_from_slice(&(body.len() as u32).to_be_bytes());
        data.extend_from_slice(body);
        offset += body.len();
    }
    let total = 128 + table.len() + data.len();

    let mut header = Vec::with_capacity(128);
    header.extend_from_slice(&(total as u32).to_be_bytes());
    header.extend_from_slice(&[0; 4]); // CMM
    header.extend_from_slice(&[0x02, 0x10, 0x00, 0x00]); // version 2.1
    header.extend_from_slice(b"mntr");
    header.extend_from_slice(colour_space);
    header.extend_from_slice(b"XYZ ");
    header.extend_from_slice(&[0; 12]); // date
    header.extend_from_slice(b"acsp");
    header.extend_from_slice(&[0; 4]); // platform
    header.extend_from_slice(&[0; 4]); // flags
    header.extend_from_slice(&[0; 4]); // manufacturer
    header.extend_from_slice(&[0; 4]); // model
    header.extend_from_slice(&[0; 8]); // attributes
    header.extend_from_slice(&[0; 4]); // perceptual intent
    for v in D50 {
        header.extend_from_slice(&s15_fixed16(v));
    }
    header.extend_from_slice(&[0; 4]); // creator
    header.extend_from_slice(&[0; 16]); // profile id
    header.resize(128, 0);

    let mut out = header;
    out.extend_from_slice(&table);
    out.extend_from_slice(&data);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::io::validate_icc_profile;

    #[test]
    fn profiles_have_valid_headers() {
        for id in [ProfileId::Srgb, ProfileId::Sgray] {
            let bytes = id.bytes();
            assert!(validate_icc_profile(bytes), "{}", id.name());
            assert_eq!(&bytes[36..40], b"acsp");
        }
        assert_eq!(&ProfileId::Srgb.bytes()[16..20], b"RGB ");
        assert_eq!(&ProfileId::Sgray.bytes()[16..20], b"GRAY");
    }

    #[test]
    fn tag_offsets_are_aligned_and_in_bounds() {
        let bytes = ProfileId::Srgb.bytes();
        let count = u32::from_be_bytes([bytes[128], bytes[129], bytes[130], bytes[131]]) as usize;
        assert_eq!(count, 9);
        for i in 0..count {
            let entry = &bytes[132 + i * 12..144 + i * 12];
            let offset = u32::from_be_bytes([entry[4], entry[5], entry[6], entry[7]]) as usize;
            let size = u32::from_be_bytes([entry[8], entry[9], entry[10], entry[11]]) as usize;
            assert_eq!(offset % 4, 0);
            assert!(offset + size <= bytes.len());
        }
    }

    #[test]
    fn profiles_parse_as_transform_targets() {
        let rgb = moxcms::ColorProfile::new_from_slice(ProfileId::Srgb.bytes()).unwrap();
        assert_eq!(rgb.color_space, moxcms::DataColorSpace::Rgb);
        let grey = moxcms::ColorProfile::new_from_slice(ProfileId::Sgray.bytes()).unwrap();
        assert_eq!(grey.color_space, moxcms::DataColorSpace::Gray);
    }
}
