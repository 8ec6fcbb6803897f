use sqlx::{Executor, QueryBuilder, Result, Sqlite, SqlitePool};

use super::{CatalogItem, ItemRecord};

const ITEM_COLUMNS: &str =
    "item.seq, item.id, item.name, item.price, item.location, item.image, item.barcode, item.category, item.fingerprint";

/// 添加或更新商品，以 `id` 判断是否已存在
pub async fn upsert_item<'c, E>(executor: E, item: &CatalogItem) -> Result<()>
where
    E: Executor<'c, Database = Sqlite>,
{
    sqlx::query(
        r#"
        INSERT INTO item (id, name, price, location, image, barcode, category, fingerprint)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT (id) DO UPDATE SET
            name = excluded.name,
            price = excluded.price,
            location = excluded.location,
            image = excluded.image,
            barcode = excluded.barcode,
            category = excluded.category,
            fingerprint = excluded.fingerprint
        "#,
    )
    .bind(&item.id)
    .bind(&item.name)
    .bind(item.price)
    .bind(&item.location)
    .bind(&item.image)
    .bind(&item.barcode)
    .bind(&item.category)
    .bind(item.fingerprint.to_bytes())
    .execute(executor)
    .await?;

    Ok(())
}

/// 删除商品，返回是否存在
pub async fn delete_item(executor: &SqlitePool, id: &str) -> Result<bool> {
    let result = sqlx::query("DELETE FROM item WHERE id = ?").bind(id).execute(executor).await?;
    Ok(result.rows_affected() > 0)
}

/// 按条码精确查找，多个商品共用条码时取名称排序的第一个
pub async fn find_by_barcode(executor: &SqlitePool, barcode: &str) -> Result<Option<ItemRecord>> {
    let sql = format!("SELECT {ITEM_COLUMNS} FROM item WHERE barcode = ? ORDER BY name LIMIT 1");
    sqlx::query_as::<_, ItemRecord>(&sql).bind(barcode).fetch_optional(executor).await
}

/// 全文检索，按 bm25 相关度排序，相关度相同时按名称排序
pub async fn search_text(
    executor: &SqlitePool,
    expression: &str,
    limit: usize,
) -> Result<Vec<ItemRecord>> {
    let sql = format!(
        r#"
        SELECT {ITEM_COLUMNS}
        FROM item_fts JOIN item ON item.seq = item_fts.rowid
        WHERE item_fts MATCH ?
        ORDER BY bm25(item_fts), item.name
        LIMIT ?
        "#
    );
    sqlx::query_as::<_, ItemRecord>(&sql)
        .bind(expression)
        .bind(limit as i64)
        .fetch_all(executor)
        .await
}

/// 根据序号批量获取商品
pub async fn get_items_by_seq(executor: &SqlitePool, seqs: &[i64]) -> Result<Vec<ItemRecord>> {
    if seqs.is_empty() {
        return Ok(vec![]);
    }
    let mut builder = QueryBuilder::<Sqlite>::new(format!("SELECT {ITEM_COLUMNS} FROM item WHERE seq IN ("));
    let mut separated = builder.separated(", ");
    for seq in seqs {
        separated.push_bind(*seq);
    }
    separated.push_unseparated(")");
    builder.build_query_as::<ItemRecord>().fetch_all(executor).await
}

/// 获取所有商品的序号与指纹
pub async fn get_fingerprints(executor: &SqlitePool) -> Result<Vec<(i64, Vec<u8>)>> {
    sqlx::query_as::<_, (i64, Vec<u8>)>("SELECT seq, fingerprint FROM item ORDER BY seq")
        .fetch_all(executor)
        .await
}

pub async fn count_items(executor: &SqlitePool) -> Result<i64> {
    sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM item").fetch_one(executor).await
}

pub async fn get_meta(executor: &SqlitePool, key: &str) -> Result<Option<String>> {
    sqlx::query_scalar::<_, String>("SELECT value FROM meta WHERE key = ?")
        .bind(key)
        .fetch_optional(executor)
        .await
}

pub async fn set_meta(executor: &SqlitePool, key: &str, value: &str) -> Result<()> {
    sqlx::query("INSERT INTO meta (key, value) VALUES (?, ?) ON CONFLICT (key) DO UPDATE SET value = excluded.value")
        .bind(key)
        .bind(value)
        .execute(executor)
        .await?;
    Ok(())
}
