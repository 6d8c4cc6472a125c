//! Codec-string computation and bitstream inspection.
//!
//! Platform decoders are configured with a canonical codec string
//! (`hvc1.2.4.L153.B0`, `avc1.64001F`, ...). When the container carries
//! an in-band configuration record (`hvcC`, `avcC`, `vpcC`, `av1C`) the
//! string is computed from it field by field; otherwise a manual mapping
//! keyed on codec name, profile and level provides a best-effort string
//! with HDR-aware defaults.
//!
//! The module also owns the small amount of NAL-unit inspection the
//! engine needs: detecting Annex-B extradata and verifying that a packet
//! really starts at a random-access point before a hardware decoder is
//! resurrected.
//!
//! Everything here is pure byte juggling with no I/O.

/// Returns whether `extradata` is Annex-B framed.
///
/// Annex-B data starts with a `00 00 01` or `00 00 00 01` start code and
/// carries no configuration record; in-box records never begin with one.
#[must_use]
pub fn is_annex_b(extradata: &[u8]) -> bool {
    extradata.starts_with(&[0, 0, 1]) || extradata.starts_with(&[0, 0, 0, 1])
}

/// Computes the canonical codec string from an in-box configuration
/// record, dispatching on the codec family.
///
/// Returns `None` when the record is too short, Annex-B framed, or the
/// codec family has no string grammar we know.
#[must_use]
pub fn codec_string_from_extradata(codec_name: &str, extradata: &[u8]) -> Option<String> {
    if is_annex_b(extradata) {
        return None;
    }

    match codec_name {
        "hevc" | "h265" => hevc_string_from_hvcc(extradata),
        "h264" | "avc" => avc_string_from_avcc(extradata),
        "av1" => av1_string_from_av1c(extradata),
        "vp9" => vp9_string_from_vpcc(extradata),
        _ => None,
    }
}

/// Builds `hvc1.<space><profile>.<compat>.<tier><level>.<constraints>`
/// from an `hvcC` record.
///
/// Layout (ISO/IEC 14496-15 §8.3.3.1):
/// * byte 0: configuration version
/// * byte 1: `profile_space` (2 bits), `tier_flag` (1), `profile_idc` (5)
/// * bytes 2..6: 32 compatibility flags, printed bit-reversed
/// * bytes 6..12: 48 constraint flags, trailing zero bytes trimmed
/// * byte 12: `level_idc`
fn hevc_string_from_hvcc(data: &[u8]) -> Option<String> {
    if data.len() < 13 {
        return None;
    }

    let profile_space = (data[1] >> 6) & 0x3;
    let tier = (data[1] >> 5) & 0x1;
    let profile_idc = data[1] & 0x1F;

    let compat = u32::from_be_bytes([data[2], data[3], data[4], data[5]]).reverse_bits();
    let level_idc = data[12];

    let mut out = String::from("hvc1.");
    match profile_space {
        1 => out.push('A'),
        2 => out.push('B'),
        3 => out.push('C'),
        _ => {}
    }
    out.push_str(&format!("{profile_idc}.{compat:X}."));
    out.push(if tier == 0 { 'L' } else { 'H' });
    out.push_str(&level_idc.to_string());

    let mut constraints: &[u8] = &data[6..12];
    while let [head @ .., 0] = constraints {
        if head.is_empty() {
            break;
        }
        constraints = head;
    }
    for byte in constraints {
        out.push_str(&format!(".{byte:X}"));
    }

    Some(out)
}

/// Builds `avc1.PPCCLL` from an `avcC` record: profile, constraint and
/// level bytes as hex.
fn avc_string_from_avcc(data: &[u8]) -> Option<String> {
    if data.len() < 4 {
        return None;
    }
    Some(format!("avc1.{:02X}{:02X}{:02X}", data[1], data[2], data[3]))
}

/// Builds `av01.P.LLT.DD` from an `av1C` record.
///
/// Layout (AV1-ISOBMFF §2.3):
/// * byte 0: marker (1 bit) + version (7 bits)
/// * byte 1: `seq_profile` (3 bits), `seq_level_idx_0` (5 bits)
/// * byte 2: `seq_tier_0` (1), `high_bitdepth` (1), `twelve_bit` (1), ...
fn av1_string_from_av1c(data: &[u8]) -> Option<String> {
    if data.len() < 3 {
        return None;
    }

    let profile = (data[1] >> 5) & 0x7;
    let level = data[1] & 0x1F;
    let tier = if (data[2] >> 7) & 0x1 == 0 { 'M' } else { 'H' };
    let high_bitdepth = (data[2] >> 6) & 0x1 == 1;
    let twelve_bit = (data[2] >> 5) & 0x1 == 1;
    let depth = match (high_bitdepth, twelve_bit) {
        (true, true) => 12,
        (true, false) => 10,
        _ => 8,
    };

    Some(format!("av01.{profile}.{level:02}{tier}.{depth:02}"))
}

/// Builds the full eight-field
/// `vp09.PP.LL.DD.CC.cp.tc.mc.FF` string from a `vpcC` record.
///
/// The record may arrive with or without its 4-byte FullBox header;
/// version 1 in the first byte marks the header as present.
fn vp9_string_from_vpcc(data: &[u8]) -> Option<String> {
    let payload = if data.first() == Some(&1) && data.len() >= 10 {
        &data[4..]
    } else {
        data
    };
    if payload.len() < 6 {
        return None;
    }

    let profile = payload[0];
    let level = payload[1];
    let bit_depth = (payload[2] >> 4) & 0xF;
    let chroma = (payload[2] >> 1) & 0x7;
    let full_range = payload[2] & 0x1;
    let primaries = payload[3];
    let transfer = payload[4];
    let matrix = payload[5];

    Some(format!(
        "vp09.{profile:02}.{level:02}.{bit_depth:02}.{chroma:02}.{primaries:02}.{transfer:02}.{matrix:02}.{full_range:02}"
    ))
}

/// Best-effort codec string when no configuration record is available.
///
/// Keyed on codec name, profile and level, with HDR-aware defaults:
/// HEVC Main10 and VP9 Profile 2 get 10-bit strings, and `is_hdr`
/// forces the 10-bit variants even when the profile is unknown.
#[must_use]
pub fn manual_codec_string(
    codec_name: &str,
    profile: i32,
    level: i32,
    is_hdr: bool,
) -> Option<String> {
    match codec_name {
        "hevc" | "h265" => {
            let level = if level > 0 { level } else { 123 };
            Some(match profile {
                4 => format!("hvc1.4.10.L{level}.B0"),
                2 => format!("hvc1.2.4.L{level}.B0"),
                _ if is_hdr => format!("hvc1.2.4.L{level}.B0"),
                _ => format!("hvc1.1.6.L{level}.B0"),
            })
        }
        "h264" | "avc" => {
            let level = if level > 0 {
                u8::try_from(level).unwrap_or(0x28)
            } else {
                0x28
            };
            Some(match profile {
                66 => format!("avc1.42E0{level:02X}"),
                77 => format!("avc1.4D40{level:02X}"),
                _ => format!("avc1.6400{level:02X}"),
            })
        }
        "vp9" => {
            let level = if level > 0 { level } else { 10 };
            Some(if profile == 2 || is_hdr {
                // BT.2020 primaries, PQ transfer, BT.2020-NCL matrix.
                format!("vp09.02.{level:02}.10.01.09.16.09.00")
            } else {
                format!("vp09.00.{level:02}.08")
            })
        }
        "av1" => {
            let level = if level > 0 { level } else { 13 };
            Some(if is_hdr {
                format!("av01.0.{level:02}M.10")
            } else {
                format!("av01.0.{level:02}M.08")
            })
        }
        "vp8" => Some("vp8".to_owned()),
        _ => None,
    }
}

/// Swaps a codec string for its nearest widely-supported profile.
///
/// Some platform decoders reject HEVC Rext (`hvc1.4.*`) outright even
/// though the actual bitstream fits Main10 constraints. Returns `None`
/// when no fallback mapping applies.
#[must_use]
pub fn compatible_profile_fallback(codec_string: &str) -> Option<String> {
    let rest = codec_string.strip_prefix("hvc1.4.")?;
    // Keep tier and level, replace profile and compat flags.
    let level = rest.split('.').nth(1)?;
    Some(format!("hvc1.2.4.{level}.B0"))
}

/// The HEVC profile idc a codec string advertises, if it is an HEVC
/// string.
#[must_use]
pub fn hevc_profile_of(codec_string: &str) -> Option<u8> {
    codec_string
        .strip_prefix("hvc1.")?
        .split('.')
        .next()?
        .trim_start_matches(['A', 'B', 'C'])
        .parse()
        .ok()
}

/// Patches the `profile_idc` bits of an `hvcC` record in place.
///
/// Used when the decoder is reconfigured with a compatible-profile
/// string: the record must advertise the same profile or the parser
/// rejects the mismatch. No-op on records too short to carry one.
pub fn patch_hevc_profile_idc(extradata: &mut [u8], profile_idc: u8) {
    if extradata.len() >= 2 && !is_annex_b(extradata) {
        extradata[1] = (extradata[1] & 0xE0) | (profile_idc & 0x1F);
    }
}

/// Iterator over NAL unit header bytes in a packet.
///
/// Handles both Annex-B (start-code delimited) and length-prefixed
/// (4-byte big-endian, as stored in ISO-BMFF samples) framing.
fn nal_headers(data: &[u8]) -> Vec<u8> {
    let mut headers = Vec::new();

    if is_annex_b(data) || data.windows(3).take(64).any(|w| w == [0, 0, 1]) {
        let mut i = 0;
        while i + 3 <= data.len() {
            if data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1 {
                if let Some(&header) = data.get(i + 3) {
                    headers.push(header);
                }
                i += 3;
            } else {
                i += 1;
            }
        }
        return headers;
    }

    // Length-prefixed framing.
    let mut i = 0usize;
    while i + 4 <= data.len() {
        let len = u32::from_be_bytes([data[i], data[i + 1], data[i + 2], data[i + 3]]) as usize;
        if len == 0 || i + 4 + len > data.len() {
            break;
        }
        headers.push(data[i + 4]);
        i += 4 + len;
    }
    headers
}

/// HEVC `nal_unit_type` from the first header byte.
#[must_use]
pub fn hevc_nal_unit_type(header: u8) -> u8 {
    (header >> 1) & 0x3F
}

/// Whether a packet truly begins at a random-access point.
///
/// A demuxer's `keyframe` flag is a container-level claim; open-GOP
/// streams mark CRA-style frames that cannot start a fresh decoder.
/// This inspects the bitstream itself:
/// * HEVC: any NAL with `nal_unit_type` 16..=21 (BLA/IDR/CRA IRAP range)
/// * H.264: any NAL with `nal_unit_type` 5 (IDR slice)
/// * Other codecs: the container flag is all we have, so trust it.
#[must_use]
pub fn packet_is_sync_frame(codec_name: &str, data: &[u8], container_keyframe: bool) -> bool {
    match codec_name {
        "hevc" | "h265" => nal_headers(data)
            .iter()
            .any(|&h| matches!(hevc_nal_unit_type(h), 16..=21)),
        "h264" | "avc" => nal_headers(data).iter().any(|&h| h & 0x1F == 5),
        _ => container_keyframe,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// hvcC for Main10 (profile 2), Main tier, level 5.1 (153),
    /// compatibility flags that reverse to 0x4, constraints `B0`.
    fn hvcc_main10() -> Vec<u8> {
        let mut data = vec![0u8; 13];
        data[0] = 1;
        data[1] = 0x02; // space 0, tier L, profile_idc 2
        data[2..6].copy_from_slice(&0x2000_0000u32.to_be_bytes());
        data[6] = 0xB0;
        data[12] = 153;
        data
    }

    #[test]
    fn hevc_main10_string() {
        assert_eq!(
            codec_string_from_extradata("hevc", &hvcc_main10()).unwrap(),
            "hvc1.2.4.L153.B0"
        );
    }

    #[test]
    fn hevc_high_tier_and_profile_space() {
        let mut data = hvcc_main10();
        data[1] = 0x41 | 0x20; // space 1, tier H, profile_idc 1
        data[2..6].copy_from_slice(&0x6000_0000u32.to_be_bytes());
        let s = codec_string_from_extradata("hevc", &data).unwrap();
        assert!(s.starts_with("hvc1.A1.6."));
        assert!(s.contains(".H153"));
    }

    #[test]
    fn avc_string_is_three_hex_bytes() {
        let data = [1u8, 0x64, 0x00, 0x1F, 0xFF];
        assert_eq!(
            codec_string_from_extradata("h264", &data).unwrap(),
            "avc1.64001F"
        );
    }

    #[test]
    fn av1_ten_bit_main_tier() {
        let data = [0x81u8, 13, 0x40];
        assert_eq!(
            codec_string_from_extradata("av1", &data).unwrap(),
            "av01.0.13M.10"
        );
    }

    #[test]
    fn vp9_full_string_with_fullbox_header() {
        let data = [
            1, 0, 0, 0, // FullBox version + flags
            2,    // profile
            10,   // level
            0xA2, // depth 10, chroma 1, full range 0
            9, 16, 9, // BT.2020 / PQ / BT.2020-NCL
            0, 0, // codec init data size
        ];
        assert_eq!(
            codec_string_from_extradata("vp9", &data).unwrap(),
            "vp09.02.10.10.01.09.16.09.00"
        );
    }

    #[test]
    fn annex_b_extradata_is_rejected() {
        assert!(is_annex_b(&[0, 0, 1, 0x40]));
        assert!(is_annex_b(&[0, 0, 0, 1, 0x67]));
        assert!(!is_annex_b(&[1, 0x64, 0, 0x1F]));
        assert!(codec_string_from_extradata("h264", &[0, 0, 0, 1, 0x67]).is_none());
    }

    #[test]
    fn manual_mapping_hdr_defaults() {
        assert_eq!(
            manual_codec_string("hevc", 2, 153, true).unwrap(),
            "hvc1.2.4.L153.B0"
        );
        assert_eq!(
            manual_codec_string("hevc", 1, 0, false).unwrap(),
            "hvc1.1.6.L123.B0"
        );
        assert_eq!(
            manual_codec_string("vp9", 2, 0, false).unwrap(),
            "vp09.02.10.10.01.09.16.09.00"
        );
        assert_eq!(
            manual_codec_string("vp9", 0, 0, false).unwrap(),
            "vp09.00.10.08"
        );
        assert_eq!(manual_codec_string("h264", 100, 0x28, false).unwrap(), "avc1.640028");
        assert!(manual_codec_string("theora", 0, 0, false).is_none());
    }

    #[test]
    fn rext_falls_back_to_main10() {
        assert_eq!(
            compatible_profile_fallback("hvc1.4.10.L153.B0").unwrap(),
            "hvc1.2.4.L153.B0"
        );
        assert!(compatible_profile_fallback("hvc1.2.4.L153.B0").is_none());
        assert!(compatible_profile_fallback("avc1.64001F").is_none());
    }

    #[test]
    fn profile_idc_patch_rewrites_only_the_low_bits() {
        let mut data = hvcc_main10();
        data[1] = 0x44; // space 1, profile 4
        patch_hevc_profile_idc(&mut data, 2);
        assert_eq!(data[1], 0x42);

        assert_eq!(hevc_profile_of("hvc1.2.4.L153.B0"), Some(2));
        assert_eq!(hevc_profile_of("hvc1.B4.10.L153.B0"), Some(4));
        assert_eq!(hevc_profile_of("avc1.64001F"), None);
    }

    #[test]
    fn hevc_irap_detection_annex_b() {
        // IDR_W_RADL is type 19 -> header byte 19 << 1 = 0x26.
        let idr = [0u8, 0, 0, 1, 0x26, 0x01, 0xAF];
        assert!(packet_is_sync_frame("hevc", &idr, false));

        // TRAIL_R is type 1 -> header 0x02.
        let trail = [0u8, 0, 0, 1, 0x02, 0x01, 0xAF];
        assert!(!packet_is_sync_frame("hevc", &trail, true));
    }

    #[test]
    fn hevc_irap_detection_length_prefixed() {
        // CRA_NUT is type 21 -> header 21 << 1 = 0x2A.
        let cra = [0u8, 0, 0, 2, 0x2A, 0x01];
        assert!(packet_is_sync_frame("hevc", &cra, false));
    }

    #[test]
    fn avc_idr_detection() {
        let idr = [0u8, 0, 0, 1, 0x65, 0x88];
        assert!(packet_is_sync_frame("h264", &idr, false));

        let non_idr = [0u8, 0, 0, 1, 0x41, 0x9A];
        assert!(!packet_is_sync_frame("h264", &non_idr, true));
    }

    #[test]
    fn unknown_codecs_trust_the_container() {
        assert!(packet_is_sync_frame("av1", &[0x12, 0x00], true));
        assert!(!packet_is_sync_frame("av1", &[0x12, 0x00], false));
    }
}
