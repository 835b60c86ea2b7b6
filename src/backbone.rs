//! Raw IPv4 protocol sockets for the backbone side. One receive socket per
//! protocol (the kernel filters raw sockets by protocol number), sends with
//! IP_HDRINCL so the dispatcher's synthesized header goes out verbatim.

use std::io;
use std::mem;
use std::net::Ipv4Addr;
use std::os::unix::io::RawFd;

pub struct RawIpSocket {
    fd: RawFd,
}

impl RawIpSocket {
    /// Open a raw socket bound to one IP protocol number. Receives time out
    /// after one second so reader threads can observe shutdown.
    pub fn open(protocol: u8) -> io::Result<Self> {
        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_RAW, protocol as libc::c_int) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let socket = Self { fd };

        let one: libc::c_int = 1;
        socket.setsockopt(libc::IPPROTO_IP, libc::IP_HDRINCL, &one)?;

        let timeout = libc::timeval {
            tv_sec: 1,
            tv_usec: 0,
        };
        socket.setsockopt(libc::SOL_SOCKET, libc::SO_RCVTIMEO, &timeout)?;

        Ok(socket)
    }

    fn setsockopt<T>(&self, level: libc::c_int, name: libc::c_int, value: &T) -> io::Result<()> {
        let ret = unsafe {
            libc::setsockopt(
                self.fd,
                level,
                name,
                value as *const T as *const libc::c_void,
                mem::size_of::<T>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Blocking receive of one datagram (IPv4 header included). Returns
    /// `WouldBlock` when the receive timeout elapses.
    pub fn recv(&self, buffer: &mut [u8]) -> io::Result<usize> {
        let len = unsafe {
            libc::recv(
                self.fd,
                buffer.as_mut_ptr() as *mut libc::c_void,
                buffer.len(),
                0,
            )
        };
        if len < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(len as usize)
    }

    /// Send a complete IPv4 datagram to `dst`.
    pub fn send(&self, datagram: &[u8], dst: Ipv4Addr) -> io::Result<usize> {
        let addr = libc::sockaddr_in {
            sin_family: libc::AF_INET as libc::sa_family_t,
            sin_port: 0,
            sin_addr: libc::in_addr {
                s_addr: u32::from(dst).to_be(),
            },
            sin_zero: [0; 8],
        };
        let len = unsafe {
            libc::sendto(
                self.fd,
                datagram.as_ptr() as *const libc::c_void,
                datagram.len(),
                0,
                &addr as *const libc::sockaddr_in as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        };
        if len < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(len as usize)
    }
}

impl Drop for RawIpSocket {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}
