mod firmware;
mod host;
mod mqtt;
mod sim;
mod store;

fn main() -> anyhow::Result<()> {
    host::run()
}
