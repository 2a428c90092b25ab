//! NETLINK_NETFILTER socket
//!
//! Closed on drop. All syscalls are blocking with a receive timeout, so
//! callers on the async runtime go through `spawn_blocking`.

use crate::netlink::{
    build_dump_request, parse_messages, ConntrackEntry, ConntrackError, ConntrackResult, Message,
};
use std::io;
use std::os::unix::io::RawFd;
use tracing::{debug, trace};

const RECV_BUFFER: usize = 64 * 1024;
/// Upper bound on one dump, roughly 250k entries
const MAX_DUMP_BYTES: usize = 64 * 1024 * 1024;

pub struct NetlinkSocket {
    fd: RawFd,
}

impl NetlinkSocket {
    /// Open and bind a ctnetlink socket
    pub fn open() -> ConntrackResult<Self> {
        // SAFETY: plain syscalls on a descriptor this function owns; every
        // error path closes it before returning.
        unsafe {
            let fd = libc::socket(
                libc::AF_NETLINK,
                libc::SOCK_RAW | libc::SOCK_CLOEXEC,
                libc::NETLINK_NETFILTER,
            );
            if fd < 0 {
                return Err(io::Error::last_os_error().into());
            }

            let mut addr: libc::sockaddr_nl = std::mem::zeroed();
            addr.nl_family = libc::AF_NETLINK as u16;

            let ret = libc::bind(
                fd,
                &addr as *const _ as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_nl>() as u32,
            );
            if ret < 0 {
                let err = io::Error::last_os_error();
                libc::close(fd);
                return Err(err.into());
            }

            let timeout = libc::timeval {
                tv_sec: 2,
                tv_usec: 0,
            };
            let ret = libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_RCVTIMEO,
                &timeout as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::timeval>() as u32,
            );
            if ret < 0 {
                let err = io::Error::last_os_error();
                libc::close(fd);
                return Err(err.into());
            }

            Ok(Self { fd })
        }
    }

    fn send(&self, data: &[u8]) -> ConntrackResult<()> {
        // SAFETY: `data` outlives the call and `addr` is a valid sockaddr_nl
        let ret = unsafe {
            let mut addr: libc::sockaddr_nl = std::mem::zeroed();
            addr.nl_family = libc::AF_NETLINK as u16;

            libc::sendto(
                self.fd,
                data.as_ptr() as *const libc::c_void,
                data.len(),
                0,
                &addr as *const _ as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_nl>() as u32,
            )
        };

        if ret < 0 {
            return Err(io::Error::last_os_error().into());
        }
        if ret as usize != data.len() {
            return Err(ConntrackError::Malformed(format!(
                "short send: {} of {} bytes",
                ret,
                data.len()
            )));
        }
        Ok(())
    }

    fn recv(&self, buffer: &mut [u8]) -> ConntrackResult<usize> {
        // SAFETY: the kernel writes at most `buffer.len()` bytes
        let ret = unsafe {
            libc::recv(
                self.fd,
                buffer.as_mut_ptr() as *mut libc::c_void,
                buffer.len(),
                0,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(ret as usize)
    }

    /// Dump the whole conntrack table
    pub fn dump(&self, seq: u32) -> ConntrackResult<Vec<ConntrackEntry>> {
        self.send(&build_dump_request(seq))?;

        let mut entries = Vec::new();
        let mut buffer = vec![0u8; RECV_BUFFER];
        let mut total = 0usize;

        loop {
            let n = self.recv(&mut buffer)?;
            if n == 0 {
                break;
            }
            total += n;

            let mut done = false;
            for message in parse_messages(&buffer[..n])? {
                match message {
                    Message::Conntrack(entry) => entries.push(entry),
                    Message::Done => done = true,
                    Message::Error(0) => {}
                    Message::Error(errno) => return Err(ConntrackError::Kernel(errno)),
                    Message::Skipped => {}
                }
            }
            if done {
                break;
            }

            if total > MAX_DUMP_BYTES {
                return Err(ConntrackError::Malformed(format!(
                    "dump exceeded {} bytes",
                    MAX_DUMP_BYTES
                )));
            }
        }

        trace!("Conntrack dump: {} bytes", total);
        debug!("Conntrack dump returned {} TCP/UDP entries", entries.len());
        Ok(entries)
    }
}

impl Drop for NetlinkSocket {
    fn drop(&mut self) {
        // SAFETY: fd was opened by `open` and is closed exactly once
        unsafe {
            libc::close(self.fd);
        }
    }
}
