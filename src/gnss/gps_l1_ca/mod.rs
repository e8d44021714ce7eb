
pub mod channel;
pub mod signal_modulation;
pub mod tracking;

pub const GPS_L1_FREQ_HZ:f64 = 1.57542e9;
pub const GPS_L1_CA_CODE_RATE_HZ:f64 = 1.023e6;
pub const GPS_L1_CA_CODE_LENGTH_CHIPS:f64 = 1023.0;
pub const GPS_L1_CA_CODE_PERIOD:f64 = GPS_L1_CA_CODE_LENGTH_CHIPS / GPS_L1_CA_CODE_RATE_HZ;
pub const GPS_TWO_PI:f64 = 2.0 * std::f64::consts::PI;
