// This file is part of Kestrel NVR, a security camera network video recorder.
// Copyright (C) 2024 The Kestrel NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! H.264 parameter set handling.
//!
//! For the most part, Kestrel NVR does not try to understand the video codec.
//! However, H.264 has two byte stream encodings: ISO/IEC 14496-10 Annex B,
//! and ISO/IEC 14496-15 AVC access units. Some RTSP sources supply the
//! former; `.mp4` files require the latter. This module manages the
//! conversion, both for the codec configuration (which must become an
//! ISO/IEC 14496-15 section 5.2.4.1 `AVCDecoderConfigurationRecord` inside an
//! `avc1` box) and the actual samples.

use base::{bail_t, Error, ErrorKind, ResultExt};
use byteorder::{BigEndian, WriteBytesExt};

// See ISO/IEC 14496-10 table 7-1 - NAL unit type codes, syntax element
// categories, and NAL unit type classes.
const NAL_UNIT_SEQ_PARAMETER_SET: u8 = 7;
const NAL_UNIT_PIC_PARAMETER_SET: u8 = 8;

const NAL_UNIT_TYPE_MASK: u8 = 0x1F; // bottom 5 bits of first byte of unit.

/// Decodes a H.264 Annex B byte stream into NAL units, calling `f` for each.
/// Aborts if `f` returns error.
///
/// See ISO/IEC 14496-10 section B.2: Byte stream NAL unit decoding process.
/// Units are separated by two or more `00` bytes followed by a `01`; leading
/// and trailing separators produce no units.
fn decode_h264_annex_b<'a, F>(data: &'a [u8], mut f: F) -> Result<(), Error>
where
    F: FnMut(&'a [u8]) -> Result<(), Error>,
{
    let len = data.len();
    let mut unit_start = 0;
    let mut i = 0;
    while i + 2 < len {
        if data[i] != 0 || data[i + 1] != 0 {
            i += 1;
            continue;
        }
        let zeros_start = i;
        let mut j = i;
        while j < len && data[j] == 0 {
            j += 1;
        }
        if j < len && data[j] == 1 && j - zeros_start >= 2 {
            if zeros_start > unit_start {
                f(&data[unit_start..zeros_start])?;
            }
            unit_start = j + 1;
        }
        i = j;
    }
    if unit_start < len {
        f(&data[unit_start..len])?;
    }
    Ok(())
}

/// Parses Annex B extra data, returning a tuple holding the `sps` and `pps`
/// substrings. Exactly one of each must be present; any other NAL unit type
/// is an error.
fn parse_annex_b_extra_data(data: &[u8]) -> Result<(&[u8], &[u8]), Error> {
    let mut sps = None;
    let mut pps = None;
    decode_h264_annex_b(data, |unit| {
        let nal_type = unit[0] & NAL_UNIT_TYPE_MASK;
        match nal_type {
            NAL_UNIT_SEQ_PARAMETER_SET if sps.is_none() => sps = Some(unit),
            NAL_UNIT_PIC_PARAMETER_SET if pps.is_none() => pps = Some(unit),
            NAL_UNIT_SEQ_PARAMETER_SET | NAL_UNIT_PIC_PARAMETER_SET => {
                bail_t!(InvalidArgument, "multiple NAL units of type {}", nal_type)
            }
            _ => bail_t!(InvalidArgument, "expected SPS and PPS; got type {}", nal_type),
        };
        Ok(())
    })?;
    match (sps, pps) {
        (Some(s), Some(p)) => Ok((s, p)),
        _ => bail_t!(InvalidArgument, "SPS and PPS must be specified"),
    }
}

/// Parsed representation of a video stream's out-of-band codec
/// configuration ("extradata").
#[derive(Debug, PartialEq, Eq)]
pub struct ExtraData {
    /// A serialized `avc1` VisualSampleEntry suitable for a `stsd` box and
    /// for deduplicated storage in the `video_sample_entry` table.
    pub sample_entry: Vec<u8>,

    pub rfc6381_codec: String,
    pub width: u16,
    pub height: u16,

    /// True iff sample data must be transformed from Annex B format to AVC
    /// format via `transform_sample_data`. (The assumption is that if the
    /// extra data was in Annex B format, the sample data is also.)
    pub need_transform: bool,
}

impl ExtraData {
    /// Parses stream extradata, which may be in either Annex B format or
    /// already an `AVCDecoderConfigurationRecord`, and builds the `avc1`
    /// sample entry around it.
    pub fn parse(extradata: &[u8], width: u16, height: u16) -> Result<ExtraData, Error> {
        let mut sps_and_pps = None;
        let need_transform;
        let avcc_len = if extradata.starts_with(b"\x00\x00\x00\x01")
            || extradata.starts_with(b"\x00\x00\x01")
        {
            // Annex B format.
            let (s, p) = parse_annex_b_extra_data(extradata)?;
            sps_and_pps = Some((s, p));
            need_transform = true;

            // This value is double-checked at the end of the function.
            19 + s.len() + p.len()
        } else {
            // Assume an AVCDecoderConfigurationRecord.
            need_transform = false;
            8 + extradata.len()
        };

        // This value is also double-checked at the end.
        let avc1_len = 86 + avcc_len;

        let mut sample_entry = Vec::with_capacity(avc1_len);

        // This is a concatenation of the following boxes/classes.

        // SampleEntry, ISO/IEC 14496-12 section 8.5.2.
        sample_entry.write_u32::<BigEndian>(avc1_len as u32).err_kind(ErrorKind::Internal)?; // length
        // type + reserved + data_reference_index = 1
        sample_entry.extend_from_slice(b"avc1\x00\x00\x00\x00\x00\x00\x00\x01");

        // VisualSampleEntry, ISO/IEC 14496-12 section 12.1.3.
        sample_entry.extend_from_slice(&[0; 16]); // pre-defined + reserved
        sample_entry.write_u16::<BigEndian>(width).err_kind(ErrorKind::Internal)?;
        sample_entry.write_u16::<BigEndian>(height).err_kind(ErrorKind::Internal)?;
        #[rustfmt::skip]
        sample_entry.extend_from_slice(&[
            0x00, 0x48, 0x00, 0x00, // horizresolution
            0x00, 0x48, 0x00, 0x00, // vertresolution
            0x00, 0x00, 0x00, 0x00, // reserved
            0x00, 0x01,             // frame count
            0x00, 0x00, 0x00, 0x00, // compressorname
            0x00, 0x00, 0x00, 0x00,
            0x00, 0x00, 0x00, 0x00,
            0x00, 0x00, 0x00, 0x00,
            0x00, 0x00, 0x00, 0x00,
            0x00, 0x00, 0x00, 0x00,
            0x00, 0x00, 0x00, 0x00,
            0x00, 0x00, 0x00, 0x00,
            0x00, 0x18, 0xff, 0xff, // depth + pre_defined
        ]);

        // AVCConfigurationBox, ISO/IEC 14496-15 section 5.3.4.1.
        let avcc_len_pos = sample_entry.len();
        sample_entry.write_u32::<BigEndian>(avcc_len as u32).err_kind(ErrorKind::Internal)?; // length
        sample_entry.extend_from_slice(b"avcC");

        if let Some((sps, pps)) = sps_and_pps {
            // Create the AVCDecoderConfigurationRecord, ISO/IEC 14496-15
            // section 5.2.4.1. The beginning takes a few values from the SPS
            // (ISO/IEC 14496-10 section 7.3.2.1.1). One caveat: that section
            // defines the syntax in terms of RBSP, not NAL, the difference
            // being the escaping of 00 00 01 and 00 00 02. It looks like 00
            // is not a valid value of profile_idc, so this distinction
            // shouldn't be relevant here.
            sample_entry.push(1); // configurationVersion
            sample_entry.push(sps[1]); // profile_idc -> AVCProfileIndication
            sample_entry.push(sps[2]); // ...misc bits... -> profile_compatibility
            sample_entry.push(sps[3]); // level_idc -> AVCLevelIndication

            // Hardcode lengthSizeMinusOne to 3, matching
            // transform_sample_data's 4-byte lengths.
            sample_entry.push(0xff);

            // Only support one SPS and PPS. This next byte is a reserved
            // 0b111 + a 5-bit # of SPSs (1).
            sample_entry.push(0xe1);
            sample_entry.write_u16::<BigEndian>(sps.len() as u16).err_kind(ErrorKind::Internal)?;
            sample_entry.extend_from_slice(sps);
            sample_entry.push(1); // # of PPSs.
            sample_entry.write_u16::<BigEndian>(pps.len() as u16).err_kind(ErrorKind::Internal)?;
            sample_entry.extend_from_slice(pps);

            if sample_entry.len() - avcc_len_pos != avcc_len {
                bail_t!(
                    Internal,
                    "internal error: anticipated AVCConfigurationBox length {}, but was actually \
                     {}; sps length {}, pps length {}",
                    avcc_len,
                    sample_entry.len() - avcc_len_pos,
                    sps.len(),
                    pps.len()
                );
            }
        } else {
            sample_entry.extend_from_slice(extradata);
        }

        if sample_entry.len() != avc1_len {
            bail_t!(
                Internal,
                "internal error: anticipated AVCSampleEntry length {}, but was actually {}",
                avc1_len,
                sample_entry.len()
            );
        }

        // The avcC's AVCProfileIndication, profile_compatibility, and
        // AVCLevelIndication sit at fixed offsets past the 86-byte avc1
        // header and 8-byte avcC box header.
        let profile_idc = sample_entry[95];
        let constraint_flags = sample_entry[96];
        let level_idc = sample_entry[97];
        let rfc6381_codec = format!("avc1.{profile_idc:02x}{constraint_flags:02x}{level_idc:02x}");
        Ok(ExtraData {
            sample_entry,
            rfc6381_codec,
            width,
            height,
            need_transform,
        })
    }
}

/// Transforms sample data from Annex B format to AVC format. Should be
/// called on samples iff `ExtraData::need_transform` is true. Uses an out
/// parameter `avc_sample` rather than a return so that memory allocations
/// can be reused from sample to sample.
pub fn transform_sample_data(annexb_sample: &[u8], avc_sample: &mut Vec<u8>) -> Result<(), Error> {
    // See AVCParameterSamples, ISO/IEC 14496-15 section 5.3.2.
    avc_sample.clear();

    // The output will be about as long as the input. Annex B separators
    // require at least three bytes; many are four. The output lengths are
    // exactly four.
    avc_sample.reserve(annexb_sample.len() + 4);
    decode_h264_annex_b(annexb_sample, |unit| {
        // 4-byte length; this must match ExtraData::parse's
        // lengthSizeMinusOne == 3.
        avc_sample.write_u32::<BigEndian>(unit.len() as u32).err_kind(ErrorKind::Internal)?;
        avc_sample.extend_from_slice(unit);
        Ok(())
    })?;
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::testdata::{ANNEX_B_TEST_INPUT, AVC_DECODER_CONFIG_TEST_INPUT};

    const TEST_OUTPUT: [u8; 132] = [
        0x00, 0x00, 0x00, 0x84, 0x61, 0x76, 0x63, 0x31, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x05, 0x00, 0x02, 0xd0, 0x00, 0x48, 0x00, 0x00, 0x00, 0x48, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x18, 0xff, 0xff, 0x00, 0x00, 0x00, 0x2e,
        0x61, 0x76, 0x63, 0x43, 0x01, 0x4d, 0x00, 0x1f, 0xff, 0xe1, 0x00, 0x17, 0x67, 0x4d, 0x00,
        0x1f, 0x9a, 0x66, 0x02, 0x80, 0x2d, 0xff, 0x35, 0x01, 0x01, 0x01, 0x40, 0x00, 0x00, 0xfa,
        0x00, 0x00, 0x1d, 0x4c, 0x01, 0x01, 0x00, 0x04, 0x68, 0xee, 0x3c, 0x80,
    ];

    #[test]
    fn test_decode() {
        let data = &ANNEX_B_TEST_INPUT;
        let mut pieces = Vec::new();
        super::decode_h264_annex_b(data, |p| {
            pieces.push(p);
            Ok(())
        })
        .unwrap();
        assert_eq!(&pieces, &[&data[4..27], &data[31..]]);
    }

    #[test]
    fn test_sample_entry_from_avc_decoder_config() {
        let e = super::ExtraData::parse(&AVC_DECODER_CONFIG_TEST_INPUT, 1280, 720).unwrap();
        assert_eq!(&e.sample_entry[..], &TEST_OUTPUT[..]);
        assert_eq!(e.width, 1280);
        assert_eq!(e.height, 720);
        assert_eq!(e.need_transform, false);
        assert_eq!(e.rfc6381_codec, "avc1.4d001f");
    }

    #[test]
    fn test_sample_entry_from_annex_b() {
        let e = super::ExtraData::parse(&ANNEX_B_TEST_INPUT, 1280, 720).unwrap();
        assert_eq!(e.width, 1280);
        assert_eq!(e.height, 720);
        assert_eq!(e.need_transform, true);
        assert_eq!(e.rfc6381_codec, "avc1.4d001f");
    }

    #[test]
    fn test_transform_sample_data() {
        #[rustfmt::skip]
        const INPUT: [u8; 64] = [
            0x00, 0x00, 0x00, 0x01, 0x67, 0x4d, 0x00, 0x1f,
            0x9a, 0x66, 0x02, 0x80, 0x2d, 0xff, 0x35, 0x01,
            0x01, 0x01, 0x40, 0x00, 0x00, 0xfa, 0x00, 0x00,
            0x1d, 0x4c, 0x01,

            0x00, 0x00, 0x00, 0x01, 0x68, 0xee, 0x3c, 0x80,

            0x00, 0x00, 0x00, 0x01, 0x06, 0x06, 0x01, 0xc4,
            0x80,

            0x00, 0x00, 0x00, 0x01, 0x65, 0x88, 0x80, 0x10,
            0x00, 0x08, 0x7f, 0x00, 0x5d, 0x27, 0xb5, 0xc1,
            0xff, 0x8c, 0xd6, 0x35,
            // (truncated)
        ];
        #[rustfmt::skip]
        const EXPECTED_OUTPUT: [u8; 64] = [
            0x00, 0x00, 0x00, 0x17, 0x67, 0x4d, 0x00, 0x1f,
            0x9a, 0x66, 0x02, 0x80, 0x2d, 0xff, 0x35, 0x01,
            0x01, 0x01, 0x40, 0x00, 0x00, 0xfa, 0x00, 0x00,
            0x1d, 0x4c, 0x01,

            0x00, 0x00, 0x00, 0x04, 0x68, 0xee, 0x3c, 0x80,

            0x00, 0x00, 0x00, 0x05, 0x06, 0x06, 0x01, 0xc4,
            0x80,

            0x00, 0x00, 0x00, 0x10, 0x65, 0x88, 0x80, 0x10,
            0x00, 0x08, 0x7f, 0x00, 0x5d, 0x27, 0xb5, 0xc1,
            0xff, 0x8c, 0xd6, 0x35,
        ];
        let mut out = Vec::new();
        super::transform_sample_data(&INPUT, &mut out).unwrap();
        assert_eq!(&out[..], &EXPECTED_OUTPUT[..]);
    }

    #[test]
    fn test_sample_entry_bad_nal() {
        // An SEI NAL unit (type 6) in the extradata is rejected.
        let data = b"\x00\x00\x00\x01\x06\x01\x02";
        super::ExtraData::parse(data, 1280, 720).unwrap_err();
    }
}
