#[cfg(any(target_os = "linux", target_os = "android"))]
mod unix;
#[cfg(any(target_os = "linux", target_os = "android"))]
pub(crate) use self::unix::*;

#[cfg(not(any(target_os = "linux", target_os = "android")))]
compile_error!("pio requires epoll, timerfd and eventfd; only Linux and Android are supported");
