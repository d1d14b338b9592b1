//! SOCKS5 wire framing (RFC 1928, user/pass sub-negotiation per RFC 1929)

use bytes::{BufMut, BytesMut};
use std::fmt;
use std::io;
use std::net::IpAddr;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::io::{read_byte, read_n};
use crate::peer::UserPassword;

pub const SOCKS_VERSION: u8 = 0x05;
pub const RESERVED: u8 = 0x00;

/// Authentication methods (IANA socks-methods registry)
#[allow(dead_code)]
pub const AUTH_METHOD_NONE: u8 = 0x00;
pub const AUTH_METHOD_PASSWORD: u8 = 0x02;
pub const AUTH_METHOD_UNACCEPTABLE: u8 = 0xFF;

/// RFC 1929 sub-negotiation
pub const PASSWORD_AUTH_VERSION: u8 = 0x01;
pub const PASSWORD_AUTH_OK: u8 = 0x00;
pub const PASSWORD_AUTH_FAIL: u8 = 0x01;

/// Address type markers
pub const ADDR_IPV4: u8 = 0x01;
pub const ADDR_DOMAIN: u8 = 0x03;
pub const ADDR_IPV6: u8 = 0x04;

/// Request commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Connect,
    Bind,
    UdpAssociate,
    Unknown(u8),
}

impl From<u8> for Command {
    fn from(value: u8) -> Self {
        match value {
            0x01 => Command::Connect,
            0x02 => Command::Bind,
            0x03 => Command::UdpAssociate,
            other => Command::Unknown(other),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Connect => write!(f, "connect"),
            Command::Bind => write!(f, "bind"),
            Command::UdpAssociate => write!(f, "associate"),
            Command::Unknown(val) => write!(f, "<{val}>"),
        }
    }
}

/// Reply codes
#[allow(dead_code)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Reply {
    Ok = 0x00,
    ErrGeneric = 0x01,
    ErrConnNotAllowed = 0x02,
    ErrNetUnreachable = 0x03,
    ErrHostUnreachable = 0x04,
    ErrConnRefused = 0x05,
    ErrTtlExpired = 0x06,
    ErrCmdNotSupported = 0x07,
    ErrAddrTypeNotSupported = 0x08,
}

/// Request target address
#[derive(Debug, Clone)]
pub struct Addr {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.parse::<std::net::Ipv6Addr>().is_ok() {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl Addr {
    /// Marshals the address for a reply frame: type marker, address bytes,
    /// big-endian port
    pub fn marshal(&self) -> io::Result<Vec<u8>> {
        let mut buff = BytesMut::new();

        if let Ok(ip) = self.host.parse::<IpAddr>() {
            match ip {
                IpAddr::V4(val) => {
                    buff.put_u8(ADDR_IPV4);
                    buff.put_slice(&val.octets());
                }
                IpAddr::V6(val) => {
                    buff.put_u8(ADDR_IPV6);
                    buff.put_slice(&val.octets());
                }
            }
        } else {
            if self.host.len() > u8::MAX as usize {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "address too large",
                ));
            }

            buff.put_u8(ADDR_DOMAIN);
            buff.put_u8(self.host.len() as u8);
            buff.put_slice(self.host.as_bytes());
        }

        buff.put_u16(self.port);

        Ok(buff.to_vec())
    }
}

/// Parsed client request
#[derive(Debug)]
pub struct Request {
    pub cmd: Command,
    pub addr: Addr,
}

fn proto_err(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

/// Reads the client greeting, returning the offered auth method set
pub async fn read_auth_methods<R>(reader: &mut R) -> io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let header = read_n(reader, 2).await?;

    if header[0] != SOCKS_VERSION {
        return Err(proto_err(format!(
            "unsupported protocol version: {:#04x}",
            header[0]
        )));
    }

    let nmethods = header[1] as usize;
    if nmethods == 0 {
        return Err(proto_err("handshake offers no auth methods"));
    }

    read_n(reader, nmethods).await
}

/// Acks the selected auth method
pub async fn write_method<W>(writer: &mut W, method: u8) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&[SOCKS_VERSION, method]).await
}

/// Reads the RFC 1929 credentials frame
pub async fn read_credentials<R>(reader: &mut R) -> io::Result<UserPassword>
where
    R: AsyncRead + Unpin,
{
    let header = read_n(reader, 2).await?;

    if header[0] != PASSWORD_AUTH_VERSION {
        return Err(proto_err(format!(
            "unexpected negotiation version: {}",
            header[0]
        )));
    }

    let user = read_n(reader, header[1] as usize).await?;
    let plen = read_byte(reader).await?;
    let password = read_n(reader, plen as usize).await?;

    Ok(UserPassword {
        user: String::from_utf8_lossy(&user).to_string(),
        password: String::from_utf8_lossy(&password).to_string(),
    })
}

/// Acks the credential sub-negotiation
pub async fn write_auth_status<W>(writer: &mut W, status: u8) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&[PASSWORD_AUTH_VERSION, status]).await
}

/// Reads the command frame and its target address
pub async fn read_request<R>(reader: &mut R) -> io::Result<Request>
where
    R: AsyncRead + Unpin,
{
    let header = read_n(reader, 3).await?;

    if header[0] != SOCKS_VERSION {
        return Err(proto_err(format!(
            "unexpected negotiation version: {}",
            header[0]
        )));
    }

    if header[2] != RESERVED {
        return Err(proto_err("trail data after command byte"));
    }

    let addr = read_addr(reader).await?;

    Ok(Request {
        cmd: Command::from(header[1]),
        addr,
    })
}

async fn read_addr<R>(reader: &mut R) -> io::Result<Addr>
where
    R: AsyncRead + Unpin,
{
    let addr_type = read_byte(reader).await?;

    let host = match addr_type {
        ADDR_IPV4 => {
            let buff = read_n(reader, 4).await?;
            IpAddr::from([buff[0], buff[1], buff[2], buff[3]]).to_string()
        }
        ADDR_IPV6 => {
            let buff = read_n(reader, 16).await?;
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&buff);
            IpAddr::from(octets).to_string()
        }
        ADDR_DOMAIN => {
            let len = read_byte(reader).await?;
            if len == 0 {
                return Err(proto_err("invalid domain name length"));
            }

            let buff = read_n(reader, len as usize).await?;
            String::from_utf8_lossy(&buff).to_string()
        }
        other => return Err(proto_err(format!("invalid addr type: {other:#04x}"))),
    };

    let port_buff = read_n(reader, 2).await?;
    let port = u16::from_be_bytes([port_buff[0], port_buff[1]]);

    Ok(Addr { host, port })
}

/// Writes a reply frame. With no address to echo, the frame terminates
/// right after the reply code.
pub async fn write_reply<W>(writer: &mut W, val: Reply, addr: Option<&Addr>) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut buff = vec![SOCKS_VERSION, val as u8];

    if let Some(addr) = addr {
        buff.push(RESERVED);
        buff.extend_from_slice(&addr.marshal()?);
    }

    writer.write_all(&buff).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_request_ipv4() {
        let mut input: &[u8] = &[0x05, 0x01, 0x00, 0x01, 93, 184, 216, 34, 0x01, 0xBB];

        let req = read_request(&mut input).await.unwrap();
        assert_eq!(req.cmd, Command::Connect);
        assert_eq!(req.addr.host, "93.184.216.34");
        assert_eq!(req.addr.port, 443);
    }

    #[tokio::test]
    async fn test_read_request_domain() {
        let mut frame = vec![0x05, 0x01, 0x00, 0x03, 11];
        frame.extend_from_slice(b"example.com");
        frame.extend_from_slice(&[0x00, 0x50]);

        let mut input: &[u8] = &frame;
        let req = read_request(&mut input).await.unwrap();
        assert_eq!(req.addr.host, "example.com");
        assert_eq!(req.addr.port, 80);
    }

    #[tokio::test]
    async fn test_read_request_rejects_bad_frames() {
        // wrong version
        let mut input: &[u8] = &[0x04, 0x01, 0x00, 0x01, 1, 2, 3, 4, 0, 80];
        assert!(read_request(&mut input).await.is_err());

        // non-zero reserved byte
        let mut input: &[u8] = &[0x05, 0x01, 0x07, 0x01, 1, 2, 3, 4, 0, 80];
        assert!(read_request(&mut input).await.is_err());

        // zero-length domain
        let mut input: &[u8] = &[0x05, 0x01, 0x00, 0x03, 0, 0, 80];
        assert!(read_request(&mut input).await.is_err());
    }

    #[tokio::test]
    async fn test_read_credentials() {
        let mut frame = vec![0x01, 7];
        frame.extend_from_slice(b"maddsua");
        frame.push(7);
        frame.extend_from_slice(b"test123");

        let mut input: &[u8] = &frame;
        let creds = read_credentials(&mut input).await.unwrap();
        assert_eq!(creds.user, "maddsua");
        assert_eq!(creds.password, "test123");
    }

    #[test]
    fn test_addr_marshal() {
        let addr = Addr {
            host: "127.0.0.1".to_string(),
            port: 1080,
        };
        assert_eq!(addr.marshal().unwrap(), vec![0x01, 127, 0, 0, 1, 0x04, 0x38]);

        let addr = Addr {
            host: "example.com".to_string(),
            port: 443,
        };
        let mut expect = vec![0x03, 11];
        expect.extend_from_slice(b"example.com");
        expect.extend_from_slice(&[0x01, 0xBB]);
        assert_eq!(addr.marshal().unwrap(), expect);
    }
}
