pub mod crc;
pub mod dsp;
pub mod framer;
pub mod rtl;
