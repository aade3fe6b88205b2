use super::types::{
    DataType, Endianness, ModbusRegister, ModbusTcpSensor, RegisterType, SensorDescriptor,
    SensorReadings, SensorSource, SensorValue, SerialBusConfig,
};
use std::time::Duration;
use thiserror::Error;
use tokio::time::timeout;
use tokio_modbus::client::Context;
use tokio_modbus::prelude::{Reader, Slave, SlaveContext};

const TCP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ModbusReadError {
    #[error("cannot resolve modbus host {0}")]
    Resolve(String),
    #[error("modbus connect to {addr} failed: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("serial port {port} unavailable: {source}")]
    Serial {
        port: String,
        #[source]
        source: tokio_serial::Error,
    },
    #[error("modbus request timed out")]
    Timeout,
    #[error("modbus io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("device answered {actual} registers, {expected} needed for {data_type:?}")]
    RegisterCount {
        expected: usize,
        actual: usize,
        data_type: DataType,
    },
}

/// Decode raw 16-bit registers into a number.
///
/// 8-bit extractions pick the high or low byte of register 0; with a little
/// `byte_order` the two are swapped. 32-bit types first order the registers
/// by `word_order` (big: register 0 is the high word), then lay the
/// `(high, low)` words out in `byte_order` and reinterpret those four bytes
/// in the same `byte_order`. Returns `None` when too few registers are given.
pub fn parse_modbus_registers(
    registers: &[u16],
    data_type: DataType,
    byte_order: Endianness,
    word_order: Endianness,
) -> Option<f64> {
    if registers.len() < data_type.register_count() as usize {
        return None;
    }
    let first = registers[0];
    let [hi_byte, lo_byte] = first.to_be_bytes();
    let (high_byte, low_byte) = match byte_order {
        Endianness::Big => (hi_byte, lo_byte),
        Endianness::Little => (lo_byte, hi_byte),
    };

    let value = match data_type {
        DataType::Uint16 => first as f64,
        DataType::Int16 => first as i16 as f64,
        DataType::Uint8High => high_byte as f64,
        DataType::Uint8Low => low_byte as f64,
        DataType::Int8High => high_byte as i8 as f64,
        DataType::Int8Low => low_byte as i8 as f64,
        DataType::Uint32 | DataType::Int32 | DataType::Float32 => {
            let bytes = pack_words(registers[0], registers[1], byte_order, word_order);
            match (data_type, byte_order) {
                (DataType::Uint32, Endianness::Big) => u32::from_be_bytes(bytes) as f64,
                (DataType::Uint32, Endianness::Little) => u32::from_le_bytes(bytes) as f64,
                (DataType::Int32, Endianness::Big) => i32::from_be_bytes(bytes) as f64,
                (DataType::Int32, Endianness::Little) => i32::from_le_bytes(bytes) as f64,
                (_, Endianness::Big) => f32::from_be_bytes(bytes) as f64,
                (_, Endianness::Little) => f32::from_le_bytes(bytes) as f64,
            }
        }
    };
    Some(value)
}

fn pack_words(first: u16, second: u16, byte_order: Endianness, word_order: Endianness) -> [u8; 4] {
    let (high, low) = match word_order {
        Endianness::Big => (first, second),
        Endianness::Little => (second, first),
    };
    let (h, l) = match byte_order {
        Endianness::Big => (high.to_be_bytes(), low.to_be_bytes()),
        Endianness::Little => (high.to_le_bytes(), low.to_le_bytes()),
    };
    [h[0], h[1], l[0], l[1]]
}

async fn read_register(
    ctx: &mut Context,
    register: &ModbusRegister,
    io_timeout: Duration,
) -> Result<f64, ModbusReadError> {
    let addr = register.register_address;
    tracing::trace!(
        slave = register.slave_id,
        function = register.register_type.function_code(),
        addr,
        "modbus read"
    );

    if register.register_type.is_bit() {
        let bits = match register.register_type {
            RegisterType::Coil => timeout(io_timeout, ctx.read_coils(addr, 1)).await,
            _ => timeout(io_timeout, ctx.read_discrete_inputs(addr, 1)).await,
        }
        .map_err(|_| ModbusReadError::Timeout)??;
        let bit = bits.first().copied().unwrap_or(false);
        return Ok(if bit { 1.0 } else { 0.0 });
    }

    let count = register.data_type.register_count();
    let words = match register.register_type {
        RegisterType::Input => {
            timeout(io_timeout, ctx.read_input_registers(addr, count)).await
        }
        _ => timeout(io_timeout, ctx.read_holding_registers(addr, count)).await,
    }
    .map_err(|_| ModbusReadError::Timeout)??;

    parse_modbus_registers(
        &words,
        register.data_type,
        register.byte_order,
        register.word_order,
    )
    .ok_or(ModbusReadError::RegisterCount {
        expected: count as usize,
        actual: words.len(),
        data_type: register.data_type,
    })
}

/// One connection per sensor; closed when the context drops.
pub async fn read_tcp_sensor(sensor: &ModbusTcpSensor) -> Result<f64, ModbusReadError> {
    let target = format!("{}:{}", sensor.host, sensor.port);
    let socket_addr = tokio::net::lookup_host((sensor.host.as_str(), sensor.port))
        .await
        .map_err(|_| ModbusReadError::Resolve(target.clone()))?
        .next()
        .ok_or_else(|| ModbusReadError::Resolve(target.clone()))?;

    let mut ctx = timeout(
        TCP_TIMEOUT,
        tokio_modbus::client::tcp::connect_slave(socket_addr, Slave(sensor.register.slave_id)),
    )
    .await
    .map_err(|_| ModbusReadError::Timeout)?
    .map_err(|source| ModbusReadError::Connect {
        addr: target,
        source,
    })?;

    read_register(&mut ctx, &sensor.register, TCP_TIMEOUT).await
}

pub async fn fetch_tcp_sensors(sensors: &[&SensorDescriptor]) -> SensorReadings {
    let mut readings = SensorReadings::new();
    for sensor in sensors {
        let SensorSource::ModbusTcp(tcp) = &sensor.source else {
            continue;
        };
        match read_tcp_sensor(tcp).await {
            Ok(value) => {
                tracing::debug!(param = %sensor.param_name, value, host = %tcp.host, "modbus tcp read");
                readings.insert(
                    sensor.param_name.clone(),
                    SensorValue::new(value.to_string(), sensor.unit.clone()),
                );
            }
            Err(err) => {
                tracing::error!(param = %sensor.param_name, host = %tcp.host, error = %err, "modbus tcp read failed");
            }
        }
    }
    readings
}

fn open_serial_bus(bus: &SerialBusConfig) -> Result<tokio_serial::SerialStream, ModbusReadError> {
    let builder = tokio_serial::new(&bus.port, bus.baudrate)
        .data_bits(data_bits(bus.bytesize))
        .parity(parity(&bus.parity))
        .stop_bits(stop_bits(bus.stopbits))
        .timeout(bus.timeout());
    tokio_serial::SerialStream::open(&builder).map_err(|source| ModbusReadError::Serial {
        port: bus.port.clone(),
        source,
    })
}

/// Every RTU sensor shares one serial connection for the duration of a fetch.
pub async fn fetch_rtu_sensors(bus: &SerialBusConfig, sensors: &[&SensorDescriptor]) -> SensorReadings {
    let mut readings = SensorReadings::new();
    let registers: Vec<(&SensorDescriptor, &ModbusRegister)> = sensors
        .iter()
        .filter_map(|sensor| match &sensor.source {
            SensorSource::ModbusRtu(register) => Some((*sensor, register)),
            _ => None,
        })
        .collect();
    let Some((_, first)) = registers.first() else {
        return readings;
    };

    let stream = match open_serial_bus(bus) {
        Ok(stream) => stream,
        Err(err) => {
            tracing::error!(error = %err, "modbus rtu bus unavailable");
            return readings;
        }
    };
    let mut ctx = tokio_modbus::client::rtu::attach_slave(stream, Slave(first.slave_id));

    for (sensor, register) in registers {
        ctx.set_slave(Slave(register.slave_id));
        match read_register(&mut ctx, register, bus.timeout()).await {
            Ok(value) => {
                tracing::debug!(param = %sensor.param_name, value, slave = register.slave_id, "modbus rtu read");
                readings.insert(
                    sensor.param_name.clone(),
                    SensorValue::new(value.to_string(), sensor.unit.clone()),
                );
            }
            Err(err) => {
                tracing::error!(param = %sensor.param_name, slave = register.slave_id, error = %err, "modbus rtu read failed");
            }
        }
    }
    readings
}

fn data_bits(bytesize: u8) -> tokio_serial::DataBits {
    match bytesize {
        5 => tokio_serial::DataBits::Five,
        6 => tokio_serial::DataBits::Six,
        7 => tokio_serial::DataBits::Seven,
        _ => tokio_serial::DataBits::Eight,
    }
}

fn parity(raw: &str) -> tokio_serial::Parity {
    match raw.trim().to_ascii_uppercase().as_str() {
        "E" | "EVEN" => tokio_serial::Parity::Even,
        "O" | "ODD" => tokio_serial::Parity::Odd,
        _ => tokio_serial::Parity::None,
    }
}

fn stop_bits(raw: u8) -> tokio_serial::StopBits {
    if raw == 2 {
        tokio_serial::StopBits::Two
    } else {
        tokio_serial::StopBits::One
    }
}
