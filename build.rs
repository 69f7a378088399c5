pub fn main() {
    // Migrations are embedded with diesel_migrations::embed_migrations!
    println!("cargo:rerun-if-changed=migrations");
}
