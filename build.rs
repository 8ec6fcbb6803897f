fn main() {
    // sqlx::migrate! 在编译期嵌入迁移脚本
    println!("cargo:rerun-if-changed=migrations");
}
