/// TCP Modbus master exercising a running slave
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use tokio_modbus::client::{tcp::connect_slave, Reader, Writer};
use tokio_modbus::slave::Slave;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let socket_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 1502);
    let mut client = connect_slave(socket_addr, Slave(1)).await?;

    client.write_single_register(5, 42).await??;
    client.write_single_register(10005, 7).await??;
    println!(
        "holding register 5: {:?}",
        client.read_holding_registers(5, 1).await??
    );
    println!(
        "input register 5: {:?}",
        client.read_input_registers(5, 1).await??
    );

    client.write_multiple_coils(10100, &[true, false, true]).await??;
    println!(
        "discrete inputs 100..103: {:?}",
        client.read_discrete_inputs(100, 3).await??
    );

    loop {
        let ticks = client.read_input_registers(0, 1).await??;
        println!("tick: {}", ticks[0]);
        tokio::time::sleep(std::time::Duration::from_millis(500)).await;
    }
}
