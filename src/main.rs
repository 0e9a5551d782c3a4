#[tokio::main]
async fn main() -> anyhow::Result<()> {
    blog_vault_lib::run().await
}
