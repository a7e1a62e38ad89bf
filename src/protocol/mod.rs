//! Wire protocol of the sensor link: telemetry frames, stream reassembly and the
//! calibration EEPROM image.

pub mod eeprom;
pub mod frame;
pub mod reassembler;

pub use eeprom::{
    decode_eeprom, encode_image, parse_dump_reply, DumpReply, EepromError, EEPROM_DUMP_COMMAND,
    EEPROM_SIZE,
};
pub use frame::{
    crc16, crc16_with, decode_payload, decode_text_record, encode_frame, DecodeError, Frame,
    FrameFormat, OperatingMode, TextLayout, FRAME_LEN, FRAME_MAGIC, PAYLOAD_LEN,
};
pub use reassembler::{FrameReassembler, ReassemblyStats};
