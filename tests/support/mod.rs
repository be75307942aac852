//! A minimal Modbus/TCP responder for integration tests.
//!
//! Speaks just enough MBAP framing for the bridge: function codes 1-6 against
//! in-memory point tables. Addresses listed as faulted answer reads with an
//! illegal-data-address exception instead of a value.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

#[derive(Default)]
struct PointTables {
    coils: HashMap<u16, bool>,
    discrete: HashMap<u16, bool>,
    input_registers: HashMap<u16, u16>,
    holding_registers: HashMap<u16, u16>,
    faulted: HashSet<u16>,
}

pub struct MockPlc {
    addr: SocketAddr,
    tables: Arc<Mutex<PointTables>>,
    handle: JoinHandle<()>,
}

impl MockPlc {
    pub async fn start() -> MockPlc {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let tables = Arc::new(Mutex::new(PointTables::default()));

        let accept_tables = Arc::clone(&tables);
        let handle = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let tables = Arc::clone(&accept_tables);
                tokio::spawn(async move {
                    let _ = serve_connection(stream, tables).await;
                });
            }
        });

        MockPlc { addr, tables, handle }
    }

    pub fn host(&self) -> String {
        self.addr.ip().to_string()
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn set_coil(&self, addr: u16, value: bool) {
        self.tables.lock().unwrap().coils.insert(addr, value);
    }

    pub fn coil(&self, addr: u16) -> bool {
        *self.tables.lock().unwrap().coils.get(&addr).unwrap_or(&false)
    }

    pub fn set_discrete_input(&self, addr: u16, value: bool) {
        self.tables.lock().unwrap().discrete.insert(addr, value);
    }

    pub fn set_input_register(&self, addr: u16, value: u16) {
        self.tables
            .lock()
            .unwrap()
            .input_registers
            .insert(addr, value);
    }

    pub fn set_holding_register(&self, addr: u16, value: u16) {
        self.tables
            .lock()
            .unwrap()
            .holding_registers
            .insert(addr, value);
    }

    pub fn holding_register(&self, addr: u16) -> u16 {
        *self
            .tables
            .lock()
            .unwrap()
            .holding_registers
            .get(&addr)
            .unwrap_or(&0)
    }

    /// Make reads at this address answer with a Modbus exception.
    pub fn fault_address(&self, addr: u16) {
        self.tables.lock().unwrap().faulted.insert(addr);
    }
}

impl Drop for MockPlc {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn serve_connection(
    mut stream: TcpStream,
    tables: Arc<Mutex<PointTables>>,
) -> std::io::Result<()> {
    loop {
        // MBAP header: transaction 2, protocol 2, length 2, unit 1.
        let mut header = [0u8; 7];
        if stream.read_exact(&mut header).await.is_err() {
            return Ok(());
        }
        let length = u16::from_be_bytes([header[4], header[5]]) as usize;
        if length < 2 {
            return Ok(());
        }
        let mut pdu = vec![0u8; length - 1];
        stream.read_exact(&mut pdu).await?;

        let response_pdu = respond(&pdu, &tables);
        let mut frame = Vec::with_capacity(7 + response_pdu.len());
        frame.extend_from_slice(&header[0..4]);
        frame.extend_from_slice(&((response_pdu.len() as u16 + 1).to_be_bytes()));
        frame.push(header[6]);
        frame.extend_from_slice(&response_pdu);
        stream.write_all(&frame).await?;
    }
}

fn respond(pdu: &[u8], tables: &Arc<Mutex<PointTables>>) -> Vec<u8> {
    let fc = pdu[0];
    if pdu.len() < 5 {
        return vec![fc | 0x80, 0x03];
    }
    let addr = u16::from_be_bytes([pdu[1], pdu[2]]);
    let arg = u16::from_be_bytes([pdu[3], pdu[4]]);
    let mut tables = tables.lock().unwrap();

    if matches!(fc, 0x01..=0x04) && tables.faulted.contains(&addr) {
        return vec![fc | 0x80, 0x02];
    }

    match fc {
        // Read coils / discrete inputs: arg is the bit count.
        0x01 | 0x02 => {
            let source = if fc == 0x01 { &tables.coils } else { &tables.discrete };
            let byte_count = arg.div_ceil(8) as usize;
            let mut bits = vec![0u8; byte_count];
            for i in 0..arg {
                if *source.get(&(addr + i)).unwrap_or(&false) {
                    bits[(i / 8) as usize] |= 1 << (i % 8);
                }
            }
            let mut resp = vec![fc, byte_count as u8];
            resp.extend_from_slice(&bits);
            resp
        }
        // Read holding / input registers: arg is the word count.
        0x03 | 0x04 => {
            let source = if fc == 0x03 {
                &tables.holding_registers
            } else {
                &tables.input_registers
            };
            let mut resp = vec![fc, (arg * 2) as u8];
            for i in 0..arg {
                let word = *source.get(&(addr + i)).unwrap_or(&0);
                resp.extend_from_slice(&word.to_be_bytes());
            }
            resp
        }
        // Write single coil: arg is 0xFF00 for on, 0x0000 for off. The
        // response echoes the request.
        0x05 => {
            tables.coils.insert(addr, arg == 0xFF00);
            pdu[0..5].to_vec()
        }
        // Write single register: arg is the value. Echoes the request.
        0x06 => {
            tables.holding_registers.insert(addr, arg);
            pdu[0..5].to_vec()
        }
        _ => vec![fc | 0x80, 0x01],
    }
}
