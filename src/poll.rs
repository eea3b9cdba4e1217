//! Thin wrapper around an epoll instance.

use std::os::unix::io::RawFd;
use std::time::Duration;

use nix::sys::epoll::{
    epoll_create1, epoll_ctl, epoll_wait, EpollCreateFlags, EpollEvent, EpollFlags, EpollOp,
};
use nix::unistd::close;

/// What a registered descriptor is waiting for.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Interest {
    Readable,
    Writable,
    /// Registered but only hang-up and error conditions are reported.
    Idle,
}

impl Interest {
    fn flags(self) -> EpollFlags {
        match self {
            Self::Readable => EpollFlags::EPOLLIN | EpollFlags::EPOLLRDHUP,
            Self::Writable => EpollFlags::EPOLLOUT,
            Self::Idle => EpollFlags::empty(),
        }
    }
}

#[derive(Debug)]
pub struct Poller {
    epfd: RawFd,
}

impl Poller {
    pub fn new() -> nix::Result<Self> {
        let epfd = epoll_create1(EpollCreateFlags::EPOLL_CLOEXEC)?;
        Ok(Self { epfd })
    }

    pub fn add(&self, fd: RawFd, interest: Interest) -> nix::Result<()> {
        let mut event = EpollEvent::new(interest.flags(), fd as u64);
        epoll_ctl(self.epfd, EpollOp::EpollCtlAdd, fd, &mut event)
    }

    pub fn modify(&self, fd: RawFd, interest: Interest) -> nix::Result<()> {
        let mut event = EpollEvent::new(interest.flags(), fd as u64);
        epoll_ctl(self.epfd, EpollOp::EpollCtlMod, fd, &mut event)
    }

    pub fn delete(&self, fd: RawFd) -> nix::Result<()> {
        epoll_ctl(self.epfd, EpollOp::EpollCtlDel, fd, None)
    }

    /// Wait for readiness. Returns the ready `(fd, flags)` pairs; empty on timeout.
    pub fn wait(
        &self,
        events: &mut [EpollEvent],
        timeout: Duration,
    ) -> nix::Result<Vec<(RawFd, EpollFlags)>> {
        let ready = epoll_wait(self.epfd, events, timeout.as_millis() as isize)?;
        Ok(events[..ready]
            .iter()
            .map(|event| (event.data() as RawFd, event.events()))
            .collect())
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        close(self.epfd).ok();
    }
}
