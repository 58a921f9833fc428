#[rocket::main]
async fn main() -> Result<(), rocket::Error> {
    println!("🛰  cc4me relay starting");
    cc4me::rocket().launch().await?;
    Ok(())
}
