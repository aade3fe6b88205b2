use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// `{param_name -> (value, unit)}` for every sensor that answered.
pub type SensorReadings = BTreeMap<String, SensorValue>;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SensorValue {
    pub value: String,
    pub unit: String,
}

impl SensorValue {
    pub fn new(value: impl Into<String>, unit: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            unit: unit.into(),
        }
    }

    pub fn numeric(&self) -> Option<f64> {
        self.value
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|value| value.is_finite())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SensorDescriptor {
    pub param_name: String,
    #[serde(default)]
    pub unit: String,
    #[serde(flatten)]
    pub source: SensorSource,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SensorSource {
    PageScrape(PageSensor),
    ModbusTcp(ModbusTcpSensor),
    ModbusRtu(ModbusRegister),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PageSensor {
    pub sensor_id: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModbusTcpSensor {
    #[serde(alias = "ip")]
    pub host: String,
    #[serde(default = "default_modbus_port")]
    pub port: u16,
    #[serde(flatten)]
    pub register: ModbusRegister,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModbusRegister {
    pub slave_id: u8,
    pub register_type: RegisterType,
    pub register_address: u16,
    pub data_type: DataType,
    #[serde(default)]
    pub byte_order: Endianness,
    #[serde(default)]
    pub word_order: Endianness,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegisterType {
    Holding,
    Input,
    Coil,
    Discrete,
}

impl RegisterType {
    pub fn function_code(self) -> u8 {
        match self {
            RegisterType::Coil => 1,
            RegisterType::Discrete => 2,
            RegisterType::Holding => 3,
            RegisterType::Input => 4,
        }
    }

    pub fn is_bit(self) -> bool {
        matches!(self, RegisterType::Coil | RegisterType::Discrete)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Uint16,
    Int16,
    Uint8High,
    Uint8Low,
    Int8High,
    Int8Low,
    Uint32,
    Int32,
    Float32,
}

impl DataType {
    pub fn register_count(self) -> u16 {
        match self {
            DataType::Uint32 | DataType::Int32 | DataType::Float32 => 2,
            _ => 1,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Endianness {
    #[default]
    Big,
    Little,
}

/// The one RS-485 bus every RTU sensor shares.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SerialBusConfig {
    pub port: String,
    #[serde(default = "default_baudrate")]
    pub baudrate: u32,
    #[serde(default = "default_parity")]
    pub parity: String,
    #[serde(default = "default_stopbits")]
    pub stopbits: u8,
    #[serde(default = "default_bytesize")]
    pub bytesize: u8,
    #[serde(default = "default_serial_timeout")]
    pub timeout: f64,
}

impl SerialBusConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs_f64(self.timeout.clamp(0.1, 60.0))
    }
}

fn default_modbus_port() -> u16 {
    502
}

fn default_baudrate() -> u32 {
    9600
}

fn default_parity() -> String {
    "N".to_string()
}

fn default_stopbits() -> u8 {
    1
}

fn default_bytesize() -> u8 {
    8
}

fn default_serial_timeout() -> f64 {
    3.0
}
