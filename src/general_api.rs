use crate::{Args, Result};
use tokio_util::sync::CancellationToken;

/// Creates the tun device described by `args` and runs the relay on it
/// until `shutdown_token` is cancelled.
pub async fn general_run_async(args: Args, shutdown_token: CancellationToken) -> Result<()> {
    let mut tun_config = tun::Configuration::default();
    tun_config.address(args.tun_address).netmask(args.tun_netmask).mtu(args.mtu).up();

    #[cfg(unix)]
    if let Some(fd) = args.tun_fd {
        tun_config.raw_fd(fd);
        if let Some(v) = args.close_fd_on_drop {
            tun_config.close_fd_on_drop(v);
        };
    } else if let Some(ref tun) = args.tun {
        tun_config.tun_name(tun);
    }
    #[cfg(windows)]
    if let Some(ref tun) = args.tun {
        tun_config.tun_name(tun);
    }

    // Datagrams are handed to the processor as bare IP packets.
    #[cfg(target_os = "linux")]
    tun_config.platform_config(|cfg| {
        #[allow(deprecated)]
        cfg.packet_information(false);
    });

    #[cfg(any(target_os = "ios", target_os = "macos"))]
    tun_config.platform_config(|cfg| {
        cfg.packet_information(false);
    });

    let device = tun::create_as_async(&tun_config)?;
    if let Ok(name) = tun::AbstractDevice::tun_name(&*device) {
        log::info!("Tun device {name} up, address {}/{}", args.tun_address, args.tun_netmask);
    }

    let join_handle = tokio::spawn(crate::run(device, args, shutdown_token));
    join_handle.await?
}
