//! `ble-snap` command line entry point

fn main() -> anyhow::Result<()> {
    ble_snap_lib::run()
}
