//! A minimal userspace NBD (Network Block Device) server: the newstyle
//! handshake followed by the request/reply loop, each request
//! dispatched onto a [`BlockDevice`].
//!
//! Grounded on `original_source/buse.h`'s `buse_operations` for the
//! five operations this server exposes (`read`/`write`/`flush`/
//! `trim`/`disc` map directly onto `NBD_CMD_READ`/`WRITE`/`FLUSH`/
//! `TRIM`/`DISC`) and on the NBD protocol itself for the wire format,
//! since the kernel ioctl transport the source actually used
//! (`buse_main` hands the device off to `/dev/nbd0` via `ioctl`) is the
//! explicitly out-of-scope external collaborator. One connection is
//! served at a time with blocking `std::net`/`std::io`, matching the
//! rest of this crate's synchronous, no-async-runtime style.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;

use crate::backend::BlockDevice;

const NBD_MAGIC: u64 = 0x4e42_444d_4147_4943; // "NBDMAGIC"
const IHAVEOPT: u64 = 0x4948_4156_454f_5054;
const NBD_OPTS_MAGIC: u64 = IHAVEOPT;
const NBD_REP_MAGIC: u64 = 0x0003_e889_0441_5175;

const NBD_FLAG_FIXED_NEWSTYLE: u16 = 1 << 0;
const NBD_FLAG_HAS_FLAGS: u16 = 1 << 0;
const NBD_FLAG_C_FIXED_NEWSTYLE: u32 = 1 << 0;
const NBD_FLAG_C_NO_ZEROES: u32 = 1 << 1;

const NBD_OPT_EXPORT_NAME: u32 = 1;
const NBD_OPT_ABORT: u32 = 2;
const NBD_OPT_LIST: u32 = 3;

const NBD_REP_ACK: u32 = 1;
const NBD_REP_ERR_UNSUP: u32 = 0x8000_0001;

const NBD_REQUEST_MAGIC: u32 = 0x2560_9513;
const NBD_REPLY_MAGIC: u32 = 0x6744_6698;

const NBD_CMD_READ: u32 = 0;
const NBD_CMD_WRITE: u32 = 1;
const NBD_CMD_DISC: u32 = 2;
const NBD_CMD_FLUSH: u32 = 3;
const NBD_CMD_TRIM: u32 = 4;

/// Bind `addr` and serve NBD connections, one at a time, forever.
/// Returns only on a bind failure; per-connection errors are logged
/// and the server moves on to accept the next connection.
pub fn serve(addr: SocketAddr, device: Arc<dyn BlockDevice>) -> io::Result<()> {
    let listener = TcpListener::bind(addr)?;
    log::info!("listening on {addr}");
    for incoming in listener.incoming() {
        match incoming {
            Ok(stream) => {
                let peer = stream.peer_addr().ok();
                if let Err(e) = handle_connection(stream, device.clone()) {
                    log::warn!("connection {peer:?} ended: {e}");
                }
            }
            Err(e) => log::warn!("accept failed: {e}"),
        }
    }
    Ok(())
}

fn handle_connection(mut stream: TcpStream, device: Arc<dyn BlockDevice>) -> io::Result<()> {
    if !handshake(&mut stream, device.as_ref())? {
        return Ok(());
    }
    transmission_loop(&mut stream, device.as_ref())
}

/// Newstyle fixed handshake, `NBD_OPT_EXPORT_NAME` only. Returns `Ok(true)`
/// once the client has selected the (single, unnamed) export and the
/// transmission phase should begin; `Ok(false)` if the client aborted.
fn handshake(stream: &mut TcpStream, device: &dyn BlockDevice) -> io::Result<bool> {
    stream.write_all(&NBD_MAGIC.to_be_bytes())?;
    stream.write_all(&IHAVEOPT.to_be_bytes())?;
    stream.write_all(&NBD_FLAG_FIXED_NEWSTYLE.to_be_bytes())?;

    let mut client_flags = [0u8; 4];
    stream.read_exact(&mut client_flags)?;
    let client_flags = u32::from_be_bytes(client_flags);
    let no_zeroes = client_flags & NBD_FLAG_C_NO_ZEROES != 0;
    let _ = client_flags & NBD_FLAG_C_FIXED_NEWSTYLE;

    loop {
        let mut opt_magic = [0u8; 8];
        stream.read_exact(&mut opt_magic)?;
        if u64::from_be_bytes(opt_magic) != NBD_OPTS_MAGIC {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "bad option magic"));
        }
        let mut opt_type = [0u8; 4];
        stream.read_exact(&mut opt_type)?;
        let opt_type = u32::from_be_bytes(opt_type);
        let mut opt_len = [0u8; 4];
        stream.read_exact(&mut opt_len)?;
        let opt_len = u32::from_be_bytes(opt_len);
        let mut opt_data = vec![0u8; opt_len as usize];
        stream.read_exact(&mut opt_data)?;

        match opt_type {
            NBD_OPT_EXPORT_NAME => {
                stream.write_all(&device.size_bytes().to_be_bytes())?;
                stream.write_all(&NBD_FLAG_HAS_FLAGS.to_be_bytes())?;
                if !no_zeroes {
                    stream.write_all(&[0u8; 124])?;
                }
                return Ok(true);
            }
            NBD_OPT_ABORT => {
                send_option_reply(stream, opt_type, NBD_REP_ACK, &[])?;
                return Ok(false);
            }
            NBD_OPT_LIST => {
                // No named exports to list: ack immediately.
                send_option_reply(stream, opt_type, NBD_REP_ACK, &[])?;
            }
            _ => {
                send_option_reply(stream, opt_type, NBD_REP_ERR_UNSUP, &[])?;
            }
        }
    }
}

fn send_option_reply(stream: &mut TcpStream, opt_type: u32, reply_type: u32, data: &[u8]) -> io::Result<()> {
    stream.write_all(&NBD_REP_MAGIC.to_be_bytes())?;
    stream.write_all(&opt_type.to_be_bytes())?;
    stream.write_all(&reply_type.to_be_bytes())?;
    stream.write_all(&(data.len() as u32).to_be_bytes())?;
    stream.write_all(data)
}

fn transmission_loop(stream: &mut TcpStream, device: &dyn BlockDevice) -> io::Result<()> {
    loop {
        let mut header = [0u8; 28];
        if let Err(e) = stream.read_exact(&mut header) {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                return Ok(());
            }
            return Err(e);
        }

        let magic = u32::from_be_bytes(header[0..4].try_into().unwrap());
        if magic != NBD_REQUEST_MAGIC {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "bad request magic"));
        }
        let cmd = u32::from_be_bytes(header[4..8].try_into().unwrap());
        let handle = u64::from_be_bytes(header[8..16].try_into().unwrap());
        let offset = u64::from_be_bytes(header[16..24].try_into().unwrap());
        let len = u32::from_be_bytes(header[24..28].try_into().unwrap());

        match cmd {
            NBD_CMD_READ => {
                let data = device.read(offset, len);
                write_reply(stream, 0, handle)?;
                stream.write_all(&data)?;
            }
            NBD_CMD_WRITE => {
                let mut payload = vec![0u8; len as usize];
                stream.read_exact(&mut payload)?;
                let error = match device.write(offset, len) {
                    Ok(()) => 0,
                    Err(_) => 28, // EFBIG: write outside the declared disk span
                };
                write_reply(stream, error, handle)?;
            }
            NBD_CMD_FLUSH => {
                device.flush();
                write_reply(stream, 0, handle)?;
            }
            NBD_CMD_TRIM => {
                device.trim(offset, len);
                write_reply(stream, 0, handle)?;
            }
            NBD_CMD_DISC => {
                device.disc();
                return Ok(());
            }
            _ => {
                log::warn!("unsupported NBD command {cmd}");
                write_reply(stream, 38, handle)?; // ENOSYS
            }
        }
    }
}

fn write_reply(stream: &mut TcpStream, error: u32, handle: u64) -> io::Result<()> {
    stream.write_all(&NBD_REPLY_MAGIC.to_be_bytes())?;
    stream.write_all(&error.to_be_bytes())?;
    stream.write_all(&handle.to_be_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Geometry;
    use crate::image::ImageBuilder;
    use std::io::{Read, Write};
    use std::net::TcpStream;
    use std::thread;

    fn test_device() -> Arc<dyn BlockDevice> {
        let g = Geometry { sectors_per_cluster: 1, fat_size_sectors: 64, ..Geometry::default() };
        Arc::new(crate::backend::Backend::new(ImageBuilder::new(g).freeze()))
    }

    #[test]
    fn handshake_and_one_read_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let device = test_device();
        let expected_size = device.size_bytes();

        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let _ = handle_connection(stream, device);
        });

        let mut client = TcpStream::connect(addr).unwrap();
        let mut magic = [0u8; 8];
        client.read_exact(&mut magic).unwrap();
        assert_eq!(u64::from_be_bytes(magic), NBD_MAGIC);
        let mut ihaveopt = [0u8; 8];
        client.read_exact(&mut ihaveopt).unwrap();
        let mut flags = [0u8; 2];
        client.read_exact(&mut flags).unwrap();

        client.write_all(&NBD_FLAG_C_FIXED_NEWSTYLE.to_be_bytes()).unwrap();

        client.write_all(&IHAVEOPT.to_be_bytes()).unwrap();
        client.write_all(&NBD_OPT_EXPORT_NAME.to_be_bytes()).unwrap();
        client.write_all(&0u32.to_be_bytes()).unwrap();

        let mut size_buf = [0u8; 8];
        client.read_exact(&mut size_buf).unwrap();
        assert_eq!(u64::from_be_bytes(size_buf), expected_size);
        let mut export_flags = [0u8; 2];
        client.read_exact(&mut export_flags).unwrap();
        let mut zero_pad = [0u8; 124];
        client.read_exact(&mut zero_pad).unwrap();

        // Send one NBD_CMD_READ for the first 512 bytes (the MBR).
        client.write_all(&NBD_REQUEST_MAGIC.to_be_bytes()).unwrap();
        client.write_all(&NBD_CMD_READ.to_be_bytes()).unwrap();
        client.write_all(&42u64.to_be_bytes()).unwrap(); // handle
        client.write_all(&0u64.to_be_bytes()).unwrap(); // offset
        client.write_all(&512u32.to_be_bytes()).unwrap(); // len

        let mut reply_header = [0u8; 16];
        client.read_exact(&mut reply_header).unwrap();
        assert_eq!(u32::from_be_bytes(reply_header[0..4].try_into().unwrap()), NBD_REPLY_MAGIC);
        assert_eq!(u32::from_be_bytes(reply_header[4..8].try_into().unwrap()), 0);
        assert_eq!(u64::from_be_bytes(reply_header[8..16].try_into().unwrap()), 42);
        let mut data = vec![0u8; 512];
        client.read_exact(&mut data).unwrap();
        assert_eq!(&data[510..512], &[0x55, 0xAA]);

        client.write_all(&NBD_REQUEST_MAGIC.to_be_bytes()).unwrap();
        client.write_all(&NBD_CMD_DISC.to_be_bytes()).unwrap();
        client.write_all(&0u64.to_be_bytes()).unwrap();
        client.write_all(&0u64.to_be_bytes()).unwrap();
        client.write_all(&0u32.to_be_bytes()).unwrap();

        server.join().unwrap();
    }
}
