use std::time::Duration;

use modbus_slave::{crc, Framer, Framing, RtuFrame, Server, ServerConfig};
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::time::{sleep, timeout};
use tokio_modbus::client::{rtu::attach_slave, Reader, Writer};
use tokio_modbus::slave::Slave;

const READ_TIMEOUT: Duration = Duration::from_millis(5);

/// Server with one serial line; returns the master's end of the line.
async fn start(framing: Framing) -> (Server, DuplexStream) {
    let config = ServerConfig {
        lower_id: 1,
        upper_id: 2,
        offset_input_registers: 10000,
        tcp: None,
        ..Default::default()
    };
    let mut server = Server::new(&config).unwrap();
    let (master, slave) = duplex(1024);
    server
        .serve_serial("line", slave, framing, READ_TIMEOUT)
        .unwrap();
    // the line is flushed until it has been quiet once
    sleep(READ_TIMEOUT * 4).await;
    (server, master)
}

async fn exchange(master: &mut DuplexStream, request: &[u8], response_len: usize) -> Vec<u8> {
    master.write_all(request).await.unwrap();
    let mut response = vec![0u8; response_len];
    timeout(Duration::from_secs(1), master.read_exact(&mut response))
        .await
        .unwrap()
        .unwrap();
    response
}

#[tokio::test]
async fn test_master_round_trip() {
    for framing in [Framing::Silence, Framing::FixedPrefix] {
        let (server, master) = start(framing).await;
        let mut client = attach_slave(master, Slave(2));

        client.write_single_register(5, 42).await.unwrap().unwrap();
        client
            .write_multiple_registers(10005, &[7, 8])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            client.read_holding_registers(5, 1).await.unwrap().unwrap(),
            vec![42]
        );
        assert_eq!(
            client.read_input_registers(5, 2).await.unwrap().unwrap(),
            vec![7, 8]
        );

        client
            .write_multiple_coils(3, &[true, false, true])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            client.read_coils(2, 4).await.unwrap().unwrap(),
            vec![false, true, false, true]
        );

        server.close().await;
    }
}

#[tokio::test]
async fn test_wire_format() {
    let (server, mut master) = start(Framing::Silence).await;

    let write = RtuFrame::new(1, 6, vec![0x00, 0x05, 0x00, 0x2A]).to_bytes();
    assert_eq!(exchange(&mut master, &write, 8).await, write);

    let read = RtuFrame::new(1, 3, vec![0x00, 0x05, 0x00, 0x01]).to_bytes();
    let response = exchange(&mut master, &read, 7).await;
    assert_eq!(&response[..5], &[0x01, 0x03, 0x02, 0x00, 0x2A]);
    assert!(crc::validate(&response));

    let illegal = RtuFrame::new(1, 3, vec![0xFF, 0xFF, 0x00, 0x02]).to_bytes();
    let response = exchange(&mut master, &illegal, 5).await;
    assert_eq!(&response[..3], &[0x01, 0x83, 0x02]);

    server.close().await;
}

#[tokio::test]
async fn test_bad_frames_do_not_block_the_line() {
    for framing in [Framing::Silence, Framing::FixedPrefix] {
        let (server, mut master) = start(framing).await;
        let read = RtuFrame::new(1, 3, vec![0x00, 0x00, 0x00, 0x01]).to_bytes();

        let mut corrupt = read.clone();
        corrupt[3] ^= 0x40;
        master.write_all(&corrupt).await.unwrap();
        sleep(READ_TIMEOUT * 4).await;

        master.write_all(&read[..5]).await.unwrap();
        sleep(READ_TIMEOUT * 4).await;

        let response = exchange(&mut master, &read, 7).await;
        assert_eq!(&response[..5], &[0x01, 0x03, 0x02, 0x00, 0x00]);

        server.close().await;
    }
}

#[tokio::test]
async fn test_unserved_unit_gets_no_response() {
    let (server, mut master) = start(Framing::Silence).await;

    let stray = RtuFrame::new(9, 3, vec![0x00, 0x00, 0x00, 0x01]).to_bytes();
    master.write_all(&stray).await.unwrap();
    let mut buf = [0u8; 16];
    assert!(timeout(Duration::from_millis(100), master.read(&mut buf))
        .await
        .is_err());

    let broadcast = RtuFrame::new(0, 6, vec![0x00, 0x01, 0x00, 0x01]).to_bytes();
    master.write_all(&broadcast).await.unwrap();
    assert!(timeout(Duration::from_millis(100), master.read(&mut buf))
        .await
        .is_err());

    server.close().await;
}
