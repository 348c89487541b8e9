/// Modbus slave serving TCP and, optionally, one serial port
use std::time::Duration;

use clap::Parser;
use modbus_slave::config::Parity;
use modbus_slave::{Framing, SerialConfig, Server, ServerConfig, TcpConfig, WordTable};

#[derive(Debug, Parser)]
#[command(about = "Multi-unit Modbus slave")]
struct Args {
    /// YAML configuration file; other flags are ignored when given
    #[arg(long)]
    config: Option<String>,
    /// Listen on ip
    #[arg(long, default_value = "0.0.0.0")]
    ip: String,
    /// Listen on TCP port
    #[arg(long, default_value_t = 1502)]
    port: u16,
    /// Lower slave unit id
    #[arg(long = "lo", default_value_t = 1)]
    lower_id: u8,
    /// Upper slave unit id
    #[arg(long = "up", default_value_t = 1)]
    upper_id: u8,
    /// Offset of holding registers copied into input registers
    #[arg(long = "ofs", default_value_t = 10000)]
    offset_input_registers: u16,
    /// Offset of coils copied into discrete inputs
    #[arg(long = "ofs-di", default_value_t = 10000)]
    offset_discrete_inputs: u16,
    /// Serial device, e.g. /dev/ttyUSB0
    #[arg(long)]
    com: Option<String>,
    /// Baud rate of the serial device
    #[arg(long, default_value_t = 19200)]
    speed: u32,
    #[arg(long, default_value_t = 8)]
    databits: u8,
    #[arg(long, default_value_t = 1)]
    stopbits: u8,
    /// 0 = none, 1 = odd, 2 = even
    #[arg(long, default_value_t = 0)]
    parity: u8,
    /// Use the fixed 8 byte prefix framing instead of silence detection
    #[arg(long)]
    fixed_prefix: bool,
    /// Count up input register 0 of every unit once per period (milliseconds)
    #[arg(long)]
    tick: Option<u64>,
}

impl Args {
    fn server_config(&self) -> Result<ServerConfig, modbus_slave::config::ConfigError> {
        if let Some(path) = &self.config {
            return ServerConfig::from_yaml_file(path);
        }

        let serial = self.com.iter().map(|path| SerialConfig {
            path: path.clone(),
            baud_rate: self.speed,
            data_bits: self.databits,
            stop_bits: self.stopbits,
            parity: match self.parity {
                1 => Parity::Odd,
                2 => Parity::Even,
                _ => Parity::None,
            },
            framing: if self.fixed_prefix {
                Framing::FixedPrefix
            } else {
                Framing::Silence
            },
            ..Default::default()
        });

        let config = ServerConfig {
            lower_id: self.lower_id,
            upper_id: self.upper_id,
            offset_input_registers: self.offset_input_registers,
            offset_discrete_inputs: self.offset_discrete_inputs,
            tcp: Some(TcpConfig {
                address: format!("{}:{}", self.ip, self.port),
            }),
            serial: serial.collect(),
            ..Default::default()
        };
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = args.server_config()?;
    let server = Server::start(&config).await?;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    match args.tick {
        Some(period) => {
            let (lower_id, upper_id) = (config.lower_id, config.upper_id);
            let mut interval = tokio::time::interval(Duration::from_millis(period));
            loop {
                tokio::select! {
                    _ = &mut ctrl_c => break,
                    _ = interval.tick() => {
                        server
                            .with_memory(move |memory| {
                                for slave_id in lower_id..=upper_id {
                                    if let Some(unit) = memory.resolve(slave_id) {
                                        let count = memory
                                            .read_words(unit, WordTable::InputRegisters, 0, 1)
                                            .map(|words| words[0])
                                            .unwrap_or_default();
                                        let _ = memory.write_word(
                                            unit,
                                            WordTable::InputRegisters,
                                            0,
                                            count.wrapping_add(1),
                                        );
                                    }
                                }
                            })
                            .await?;
                    }
                }
            }
        }
        None => ctrl_c.await?,
    }

    server.close().await;
    Ok(())
}
