//! Open-socket handoff between processes.
//!
//! A handler process returns a still-open connection socket to the supervisor
//! by sending the descriptor as `SCM_RIGHTS` ancillary data over the
//! per-connection control channel (a `socketpair`). If the handler exits
//! without sending anything, the supervisor reads EOF on the channel and
//! treats the connection as closed.

use std::io;
use std::mem;
use std::net::TcpStream;
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::ptr;

/// Control message buffer sized for a single descriptor, u64-aligned to
/// satisfy `cmsghdr` alignment.
const CMSG_WORDS: usize = 8;

/// Send `fd` over the control channel, together with a one-byte payload so
/// the receiver can distinguish a handoff from channel EOF.
pub(crate) fn send_fd(channel: &impl AsRawFd, fd: RawFd) -> io::Result<()> {
    let payload = [1u8];
    let mut iov = libc::iovec {
        iov_base: payload.as_ptr() as *mut libc::c_void,
        iov_len: 1,
    };
    let mut cmsg_buf = [0u64; CMSG_WORDS];

    unsafe {
        let mut msg: libc::msghdr = mem::zeroed();
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
        msg.msg_controllen = libc::CMSG_SPACE(mem::size_of::<RawFd>() as u32) as _;

        let cmsg = libc::CMSG_FIRSTHDR(&msg);
        (*cmsg).cmsg_level = libc::SOL_SOCKET;
        (*cmsg).cmsg_type = libc::SCM_RIGHTS;
        (*cmsg).cmsg_len = libc::CMSG_LEN(mem::size_of::<RawFd>() as u32) as _;
        ptr::copy_nonoverlapping(
            &fd as *const RawFd as *const u8,
            libc::CMSG_DATA(cmsg),
            mem::size_of::<RawFd>(),
        );

        if libc::sendmsg(channel.as_raw_fd(), &msg, 0) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Receive a descriptor from the control channel.
///
/// Returns `Ok(None)` if the channel reached EOF without carrying a
/// descriptor, meaning the handler exited and the connection is finished.
pub(crate) fn recv_fd(channel: &impl AsRawFd) -> io::Result<Option<RawFd>> {
    let mut payload = [0u8; 1];
    let mut iov = libc::iovec {
        iov_base: payload.as_mut_ptr() as *mut libc::c_void,
        iov_len: 1,
    };
    let mut cmsg_buf = [0u64; CMSG_WORDS];

    unsafe {
        let mut msg: libc::msghdr = mem::zeroed();
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
        msg.msg_controllen = mem::size_of_val(&cmsg_buf) as _;

        let n = libc::recvmsg(channel.as_raw_fd(), &mut msg, 0);
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        if n == 0 {
            return Ok(None);
        }

        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
                let mut fd: RawFd = -1;
                ptr::copy_nonoverlapping(
                    libc::CMSG_DATA(cmsg),
                    &mut fd as *mut RawFd as *mut u8,
                    mem::size_of::<RawFd>(),
                );
                return Ok(Some(fd));
            }
            cmsg = libc::CMSG_NXTHDR(&mut msg, cmsg);
        }
    }

    // Data without a descriptor: the handler broke the handoff protocol.
    Err(io::Error::new(
        io::ErrorKind::InvalidData,
        "control message carried no descriptor",
    ))
}

/// Receive a handed-back connection socket, if the handler sent one.
pub(crate) fn recv_socket(channel: &impl AsRawFd) -> io::Result<Option<TcpStream>> {
    match recv_fd(channel)? {
        Some(fd) => Ok(Some(unsafe { TcpStream::from_raw_fd(fd) })),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::os::unix::net::UnixStream;

    #[test]
    fn test_fd_round_trip() {
        let (control_tx, control_rx) = UnixStream::pair().unwrap();
        let (mut writer, reader) = UnixStream::pair().unwrap();

        send_fd(&control_tx, reader.as_raw_fd()).unwrap();
        let fd = recv_fd(&control_rx).unwrap().expect("descriptor expected");

        // The received descriptor must reach the same open file description.
        let mut received = unsafe { UnixStream::from_raw_fd(fd) };
        writer.write_all(b"through the handoff").unwrap();
        drop(writer);

        let mut buf = Vec::new();
        received.read_to_end(&mut buf).unwrap();
        assert_eq!(buf, b"through the handoff");
    }

    #[test]
    fn test_eof_means_no_handoff() {
        let (control_tx, control_rx) = UnixStream::pair().unwrap();
        drop(control_tx);
        assert!(recv_fd(&control_rx).unwrap().is_none());
    }

    #[test]
    fn test_payload_without_descriptor_is_an_error() {
        let (mut control_tx, control_rx) = UnixStream::pair().unwrap();
        control_tx.write_all(&[1]).unwrap();
        assert!(recv_fd(&control_rx).is_err());
    }
}
