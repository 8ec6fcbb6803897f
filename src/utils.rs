use indicatif::ProgressStyle;

use crate::db::CatalogItem;

pub fn pb_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos:>7}/{len:7} {msg}")
        .expect("invalid progress bar template")
        .progress_chars("##-")
}

/// 以制表符分隔的一行输出商品信息
pub fn format_item(item: &CatalogItem) -> String {
    format!(
        "{:.2}\t{}\t{}\t{}\t{}",
        item.price,
        item.name,
        item.location,
        item.category.as_deref().unwrap_or("-"),
        item.barcode.as_deref().unwrap_or("-"),
    )
}
