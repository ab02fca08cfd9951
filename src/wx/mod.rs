//! Sensor semantics of the 8-byte Davis payload.
//!
//! Every transmission carries wind speed and direction plus one other
//! reading selected by the type nibble. Sensor-absent sentinel values
//! surface as [`DecodeError::NoSensor`], never as numbers.

pub mod wind;

use failure::Fail;

use crate::hop::plan::Region;
use crate::sdr::framer::Packet;

impl Packet {
    /// High nibble of byte 0.
    pub fn message_type(&self) -> u8 {
        (self.data[0] >> 4) & 0x0F
    }

    pub fn battery_low(&self) -> bool {
        self.data[0] & 0x08 != 0
    }

    /// 3-bit transmitter id.
    pub fn station_id(&self) -> u8 {
        self.data[0] & 0x07
    }

    pub fn wind_speed_mph(&self) -> u8 {
        self.data[1]
    }

    /// Wind direction in degrees, scaled out of the single raw byte.
    pub fn wind_direction_deg(&self) -> i16 {
        (self.data[2] as f32 * 360.0 / 255.0).round() as i16
    }
}

/// Rain collector size. Davis ships a 0.01 in tipping spoon in the US and
/// a 0.2 mm spoon in Europe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bucket {
    In001,
    Mm02,
}

impl Bucket {
    pub fn for_region(region: Region) -> Bucket {
        match region {
            Region::Eu => Bucket::Mm02,
            Region::Us | Region::Nz => Bucket::In001,
        }
    }

    fn inches_per_click(self) -> f32 {
        match self {
            Bucket::In001 => 0.01,
            Bucket::Mm02 => 0.2 / 25.4,
        }
    }
}

/// A decoded type-specific sensor value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Reading {
    /// Storage capacitor voltage.
    SupercapVolts(f32),
    UvIndex(f32),
    /// Rain intensity in inches per hour.
    RainRate(f32),
    /// Solar irradiance in W/m².
    SolarRadiation(f32),
    /// Solar panel output voltage.
    SolarVolts(f32),
    /// Outside temperature in °F.
    TemperatureF(f32),
    /// 10-minute wind gust.
    WindGust { mph: u8, index: u8 },
    /// Relative humidity in percent.
    Humidity(f32),
    /// Running bucket-tip counter, wraps at 128.
    RainCount(u8),
}

#[derive(Debug, Fail, PartialEq)]
pub enum DecodeError {
    #[fail(display = "sensor not present")]
    NoSensor,
    #[fail(display = "analog temperature sensor is not supported")]
    AnalogUnsupported,
    #[fail(display = "unknown message type {:#04x}", _0)]
    UnknownType(u8),
}

/// Interprets the type-specific bytes of a validated packet.
pub fn decode(pkt: &Packet, bucket: Bucket) -> Result<Reading, DecodeError> {
    let b3 = pkt.data[3] as u16;
    let b4 = pkt.data[4] as u16;

    match pkt.message_type() {
        0x02 => {
            let raw = (b3 << 2 | b4 >> 6) & 0x3FF;
            if raw == 0x3FF {
                return Err(DecodeError::NoSensor);
            }
            Ok(Reading::SupercapVolts(raw as f32 / 300.0))
        }
        0x04 => {
            if pkt.data[3] == 0xFF {
                return Err(DecodeError::NoSensor);
            }
            let raw = (b3 << 8 | b4) >> 6;
            Ok(Reading::UvIndex(raw as f32 / 50.0))
        }
        0x05 => Ok(Reading::RainRate(rain_rate(pkt, bucket))),
        0x06 => {
            let raw = (b3 << 8 | b4) >> 6;
            if pkt.data[3] == 0xFF || raw >= 0x3FE {
                return Err(DecodeError::NoSensor);
            }
            Ok(Reading::SolarRadiation(raw as f32 * 1.757936))
        }
        0x07 => {
            let raw = (b3 << 2 | b4 >> 6) & 0x3FF;
            if raw == 0x3FF {
                return Err(DecodeError::NoSensor);
            }
            Ok(Reading::SolarVolts(raw as f32 / 300.0))
        }
        0x08 => {
            // old analog sensors report through an A/D with different
            // scaling; nobody has one worth supporting
            if b4 & 0x08 == 0 {
                return Err(DecodeError::AnalogUnsupported);
            }
            let raw = (b3 << 4) | (b4 >> 4);
            if raw == 0x0FFC {
                return Err(DecodeError::NoSensor);
            }
            Ok(Reading::TemperatureF(raw as f32 / 10.0))
        }
        0x09 => Ok(Reading::WindGust {
            mph: pkt.data[3],
            index: pkt.data[5] >> 4,
        }),
        0x0A => {
            let raw = ((b4 >> 4) << 8) | b3;
            if raw == 0 {
                return Err(DecodeError::NoSensor);
            }
            Ok(Reading::Humidity(raw as f32 / 10.0))
        }
        0x0E => Ok(Reading::RainCount(pkt.data[3] & 0x7F)),
        other => Err(DecodeError::UnknownType(other)),
    }
}

/// Rain rate from the time between bucket tips.
///
/// Byte 3 of 0xFF means the time is infinite: no rain. Otherwise bytes 3/4
/// hold a tip interval; bit 6 of byte 4 clear marks the "heavy" encoding
/// where the interval is scaled up 16x for resolution.
fn rain_rate(pkt: &Packet, bucket: Bucket) -> f32 {
    if pkt.data[3] == 0xFF {
        return 0.0;
    }
    let time_raw = (((pkt.data[4] as u16) & 0x30) << 4) | pkt.data[3] as u16;
    let clicks_per_hour = if pkt.data[4] & 0x40 == 0 {
        576_000.0 / time_raw as f32
    } else {
        3_600.0 / time_raw as f32
    };
    clicks_per_hour * bucket.inches_per_click()
}
