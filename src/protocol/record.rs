//! Binary record of a [`SamplerConfiguration`] as stored by a device.
//!
//! All fields are little endian, in this order:
//!
//! | field                          | size |
//! |--------------------------------|------|
//! | version                        | 4    |
//! | mode                           | 1    |
//! | flags (bit 0 software, bit 1 new firmware sampler) | 1 |
//! | period                         | 2    |
//! | duration                       | 4    |
//! | pre-trigger samples            | 2    |
//! | start trigger, stop trigger    | 8 each: condition 1, index 2, subindex 1, value 4 |
//! | number of tracked addresses    | 1    |
//! | tracked addresses              | 3 each: index 2, subindex 1 |

use std::io::{Cursor, Read};

use byteorder::{ReadBytesExt, WriteBytesExt, LE};
use num_traits::FromPrimitive;
use zerocopy::AsBytes;

use crate::protocol::config::MAX_TRACKED_ADDRESSES;
use crate::{ConfigError, OdIndex, SamplerConfiguration, SamplerMode, SamplerTrigger, TriggerCondition};

const FLAG_SOFTWARE: u8 = 0x01;
const FLAG_NEW_FW_SAMPLER: u8 = 0x02;

const HEADER_LEN: usize = 14;
const TRIGGER_LEN: usize = 8;
const ADDRESS_LEN: usize = 3;

impl SamplerConfiguration {
    /// Encodes the configuration as a device record.
    pub fn to_record(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(
            HEADER_LEN + 2 * TRIGGER_LEN + 1 + ADDRESS_LEN * self.tracked_addresses.len(),
        );
        let mut flags = 0;
        if self.using_software_implementation {
            flags |= FLAG_SOFTWARE;
        }
        if self.using_new_fw_sampler_implementation {
            flags |= FLAG_NEW_FW_SAMPLER;
        }

        if let Err(e) = write_record(&mut buf, self, flags) {
            log::error!("failed to encode sampler configuration record: {}", e);
        }
        buf
    }

    /// Decodes a device record.
    pub fn from_record(record: &[u8]) -> Result<Self, ConfigError> {
        let mut rdr = Cursor::new(record);
        let config = read_record(&mut rdr)?;
        let consumed = rdr.position() as usize;
        if consumed != record.len() {
            return Err(ConfigError::MalformedRecord(format!(
                "{} trailing bytes: {}",
                record.len() - consumed,
                hex::encode(&record[consumed..])
            )));
        }
        Ok(config)
    }
}

fn write_record(
    buf: &mut Vec<u8>,
    config: &SamplerConfiguration,
    flags: u8,
) -> std::io::Result<()> {
    buf.write_u32::<LE>(config.version)?;
    buf.extend_from_slice(config.mode.as_bytes());
    buf.write_u8(flags)?;
    buf.write_u16::<LE>(config.period_milliseconds)?;
    buf.write_u32::<LE>(config.duration_milliseconds)?;
    buf.write_u16::<LE>(config.pre_trigger_number_of_samples)?;
    for trigger in [&config.start_trigger, &config.stop_trigger] {
        buf.extend_from_slice(trigger.condition.as_bytes());
        write_address(buf, trigger.address)?;
        buf.write_u32::<LE>(trigger.value)?;
    }
    // counts beyond one byte are rejected by validation, the record keeps the low byte
    buf.write_u8(config.tracked_addresses.len() as u8)?;
    for &address in &config.tracked_addresses {
        write_address(buf, address)?;
    }
    Ok(())
}

fn write_address(buf: &mut Vec<u8>, address: OdIndex) -> std::io::Result<()> {
    buf.write_u16::<LE>(address.index)?;
    buf.write_u8(address.subindex)
}

fn read_record(rdr: &mut Cursor<&[u8]>) -> Result<SamplerConfiguration, ConfigError> {
    let version = rdr.read_u32::<LE>().map_err(truncated("version"))?;
    let mode = rdr.read_u8().map_err(truncated("mode"))?;
    let mode = SamplerMode::from_u8(mode)
        .ok_or_else(|| ConfigError::MalformedRecord(format!("unknown sampler mode {}", mode)))?;
    let flags = rdr.read_u8().map_err(truncated("flags"))?;
    let period_milliseconds = rdr.read_u16::<LE>().map_err(truncated("period"))?;
    let duration_milliseconds = rdr.read_u32::<LE>().map_err(truncated("duration"))?;
    let pre_trigger_number_of_samples = rdr.read_u16::<LE>().map_err(truncated("pre-trigger samples"))?;
    let start_trigger = read_trigger(rdr, "start trigger")?;
    let stop_trigger = read_trigger(rdr, "stop trigger")?;

    let count = usize::from(rdr.read_u8().map_err(truncated("address count"))?);
    if count > MAX_TRACKED_ADDRESSES {
        return Err(ConfigError::MalformedRecord(format!(
            "{} tracked addresses",
            count
        )));
    }
    let tracked_addresses = (0..count)
        .map(|_| read_address(rdr).map_err(truncated("tracked address")))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(SamplerConfiguration {
        version,
        mode,
        using_software_implementation: flags & FLAG_SOFTWARE != 0,
        using_new_fw_sampler_implementation: flags & FLAG_NEW_FW_SAMPLER != 0,
        period_milliseconds,
        duration_milliseconds,
        pre_trigger_number_of_samples,
        start_trigger,
        stop_trigger,
        tracked_addresses,
    })
}

fn read_trigger(rdr: &mut Cursor<&[u8]>, what: &'static str) -> Result<SamplerTrigger, ConfigError> {
    let mut raw = [0; TRIGGER_LEN];
    rdr.read_exact(&mut raw).map_err(truncated(what))?;
    let mut fields = Cursor::new(&raw[..]);
    let condition = fields.read_u8().map_err(truncated(what))?;
    let condition = TriggerCondition::from_u8(condition).ok_or_else(|| {
        ConfigError::MalformedRecord(format!("{}: unknown condition 0x{:02X}", what, condition))
    })?;
    let address = read_address(&mut fields).map_err(truncated(what))?;
    let value = fields.read_u32::<LE>().map_err(truncated(what))?;
    Ok(SamplerTrigger::new(condition, address, value))
}

fn read_address(rdr: &mut Cursor<&[u8]>) -> std::io::Result<OdIndex> {
    let index = rdr.read_u16::<LE>()?;
    let subindex = rdr.read_u8()?;
    Ok(OdIndex::new(index, subindex))
}

fn truncated(what: &'static str) -> impl Fn(std::io::Error) -> ConfigError {
    move |e| ConfigError::MalformedRecord(format!("{}: {}", what, e))
}
