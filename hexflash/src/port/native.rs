//! Native serial port implementation using the `serialport` crate.

use {
    crate::{
        error::Result,
        port::{DataBits, FlowControl, Parity, Port, SerialConfig, StopBits},
    },
    log::debug,
    serialport::ClearBuffer,
    std::io::{Read, Write},
};

/// Native serial port implementation.
pub struct NativePort {
    port: Option<Box<dyn serialport::SerialPort>>,
    name: String,
}

impl NativePort {
    /// Open a serial port with the given configuration.
    pub fn open(config: &SerialConfig) -> Result<Self> {
        debug!(
            "Opening {} at {} baud (timeout {:?})",
            config.port_name, config.baud_rate, config.timeout
        );

        let port = serialport::new(&config.port_name, config.baud_rate)
            .timeout(config.timeout)
            .data_bits(
                config
                    .data_bits
                    .into(),
            )
            .parity(
                config
                    .parity
                    .into(),
            )
            .stop_bits(
                config
                    .stop_bits
                    .into(),
            )
            .flow_control(
                config
                    .flow_control
                    .into(),
            )
            .open()?;

        Ok(Self {
            port: Some(port),
            name: config
                .port_name
                .clone(),
        })
    }

    fn closed() -> std::io::Error {
        std::io::Error::new(std::io::ErrorKind::NotConnected, "port closed")
    }
}

impl Port for NativePort {
    fn clear_buffers(&mut self) -> Result<()> {
        if let Some(ref mut p) = self.port {
            p.clear(ClearBuffer::All)?;
        }
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn close(&mut self) -> Result<()> {
        // Dropping the handle closes the device
        self.port
            .take();
        Ok(())
    }
}

impl Read for NativePort {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.port
            .as_mut()
            .ok_or_else(Self::closed)
            .and_then(|p| p.read(buf))
    }
}

impl Write for NativePort {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.port
            .as_mut()
            .ok_or_else(Self::closed)
            .and_then(|p| p.write(buf))
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.port
            .as_mut()
            .ok_or_else(Self::closed)
            .and_then(std::io::Write::flush)
    }
}

// Type conversions from our types to serialport types

impl From<DataBits> for serialport::DataBits {
    fn from(bits: DataBits) -> Self {
        match bits {
            DataBits::Seven => Self::Seven,
            DataBits::Eight => Self::Eight,
        }
    }
}

impl From<Parity> for serialport::Parity {
    fn from(parity: Parity) -> Self {
        match parity {
            Parity::None => Self::None,
            Parity::Odd => Self::Odd,
            Parity::Even => Self::Even,
        }
    }
}

impl From<StopBits> for serialport::StopBits {
    fn from(bits: StopBits) -> Self {
        match bits {
            StopBits::One => Self::One,
            StopBits::Two => Self::Two,
        }
    }
}

impl From<FlowControl> for serialport::FlowControl {
    fn from(flow: FlowControl) -> Self {
        match flow {
            FlowControl::None => Self::None,
            FlowControl::Hardware => Self::Hardware,
            FlowControl::Software => Self::Software,
        }
    }
}
