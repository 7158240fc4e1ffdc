use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};

use foliofox_model::{Book, BookId};

use crate::error::Result;

/// Typed access to `books` and its join tables.
#[derive(Clone, Debug)]
pub struct BookRepository {
    pool: SqlitePool,
}

impl BookRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Insert a book row plus its author/genre/tag joins. The id on the
    /// input is ignored; the catalog assigns one.
    pub async fn insert(&self, book: &Book) -> Result<BookId> {
        book.validate()?;
        let mut tx = self.pool().begin().await?;

        let publisher_id = match &book.publisher {
            Some(name) => Some(ensure_named_row(&mut tx, "publishers", name).await?),
            None => None,
        };
        let language_id = match &book.language {
            Some(code) => Some(ensure_row(&mut tx, "languages", "code", code).await?),
            None => None,
        };
        let series_id = match &book.series {
            Some(name) => Some(ensure_named_row(&mut tx, "series", name).await?),
            None => None,
        };

        let result = sqlx::query(
            r#"
            INSERT INTO books (
                title, subtitle, description, isbn10, isbn13, asin,
                publication_date, publisher_id, language_id, page_count,
                rating_avg, rating_count, series_id, series_position,
                file_count, total_file_size, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&book.title)
        .bind(&book.subtitle)
        .bind(&book.description)
        .bind(&book.isbn10)
        .bind(&book.isbn13)
        .bind(&book.asin)
        .bind(&book.publication_date)
        .bind(publisher_id)
        .bind(language_id)
        .bind(book.page_count.map(|n| n as i64))
        .bind(book.rating_avg)
        .bind(book.rating_count as i64)
        .bind(series_id)
        .bind(book.series_position)
        .bind(book.file_count as i64)
        .bind(book.total_file_size as i64)
        .bind(book.created_at)
        .bind(book.updated_at)
        .execute(&mut *tx)
        .await?;

        let id = BookId(result.last_insert_rowid());
        replace_authors(&mut tx, id, &book.authors).await?;
        replace_set_joins(&mut tx, id, "genres", "book_genres", "genre_id", &book.genres)
            .await?;
        replace_set_joins(&mut tx, id, "tags", "book_tags", "tag_id", &book.tags).await?;
        tx.commit().await?;
        Ok(id)
    }

    pub async fn get(&self, id: BookId) -> Result<Option<Book>> {
        let row = sqlx::query(&format!("{BOOK_SELECT} WHERE b.id = ?"))
            .bind(id.as_i64())
            .fetch_optional(self.pool())
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let mut book = map_book_row(&row)?;
        self.attach_joins(std::slice::from_mut(&mut book)).await?;
        Ok(Some(book))
    }

    /// All books, join tables attached, for a deduplication scan.
    pub async fn list_for_dedup(&self, limit: Option<u32>) -> Result<Vec<Book>> {
        let sql = match limit {
            Some(_) => format!("{BOOK_SELECT} ORDER BY b.id LIMIT ?"),
            None => format!("{BOOK_SELECT} ORDER BY b.id"),
        };
        let mut query = sqlx::query(&sql);
        if let Some(limit) = limit {
            query = query.bind(limit as i64);
        }
        let rows = query.fetch_all(self.pool()).await?;

        let mut books = Vec::with_capacity(rows.len());
        for row in &rows {
            books.push(map_book_row(row)?);
        }
        self.attach_joins(&mut books).await?;
        Ok(books)
    }

    pub async fn exists(&self, id: BookId) -> Result<bool> {
        let row = sqlx::query("SELECT 1 AS present FROM books WHERE id = ?")
            .bind(id.as_i64())
            .fetch_optional(self.pool())
            .await?;
        Ok(row.is_some())
    }

    /// Bulk-load authors, genres, and tags for the given books.
    async fn attach_joins(&self, books: &mut [Book]) -> Result<()> {
        if books.is_empty() {
            return Ok(());
        }
        let mut index: HashMap<i64, usize> = HashMap::with_capacity(books.len());
        for (pos, book) in books.iter().enumerate() {
            index.insert(book.id.as_i64(), pos);
        }

        let author_rows = sqlx::query(
            r#"
            SELECT ba.book_id, a.name
            FROM book_authors ba
            JOIN authors a ON a.id = ba.author_id
            ORDER BY ba.book_id, ba.position
            "#,
        )
        .fetch_all(self.pool())
        .await?;
        for row in author_rows {
            let book_id: i64 = row.try_get("book_id")?;
            if let Some(&pos) = index.get(&book_id) {
                books[pos].authors.push(row.try_get("name")?);
            }
        }

        for (join_table, ref_table, key, target) in [
            ("book_genres", "genres", "genre_id", JoinTarget::Genres),
            ("book_tags", "tags", "tag_id", JoinTarget::Tags),
        ] {
            let sql = format!(
                "SELECT j.book_id, r.name FROM {join_table} j \
                 JOIN {ref_table} r ON r.id = j.{key}",
            );
            let rows = sqlx::query(&sql).fetch_all(self.pool()).await?;
            for row in rows {
                let book_id: i64 = row.try_get("book_id")?;
                if let Some(&pos) = index.get(&book_id) {
                    let name: String = row.try_get("name")?;
                    match target {
                        JoinTarget::Genres => books[pos].genres.insert(name),
                        JoinTarget::Tags => books[pos].tags.insert(name),
                    };
                }
            }
        }
        Ok(())
    }
}

#[derive(Clone, Copy)]
enum JoinTarget {
    Genres,
    Tags,
}

const BOOK_SELECT: &str = r#"
    SELECT
        b.id, b.title, b.subtitle, b.description, b.isbn10, b.isbn13,
        b.asin, b.publication_date, p.name AS publisher, l.code AS language,
        b.page_count, b.rating_avg, b.rating_count, s.name AS series,
        b.series_position, b.file_count, b.total_file_size,
        b.created_at, b.updated_at
    FROM books b
    LEFT JOIN publishers p ON p.id = b.publisher_id
    LEFT JOIN languages l ON l.id = b.language_id
    LEFT JOIN series s ON s.id = b.series_id
"#;

fn map_book_row(row: &SqliteRow) -> Result<Book> {
    Ok(Book {
        id: BookId(row.try_get("id")?),
        title: row.try_get("title")?,
        subtitle: row.try_get("subtitle")?,
        description: row.try_get("description")?,
        isbn10: row.try_get("isbn10")?,
        isbn13: row.try_get("isbn13")?,
        asin: row.try_get("asin")?,
        publication_date: row.try_get("publication_date")?,
        publisher: row.try_get("publisher")?,
        language: row.try_get("language")?,
        page_count: row
            .try_get::<Option<i64>, _>("page_count")?
            .map(|n| n as u32),
        rating_avg: row.try_get("rating_avg")?,
        rating_count: row.try_get::<i64, _>("rating_count")? as u32,
        series: row.try_get("series")?,
        series_position: row.try_get("series_position")?,
        authors: Vec::new(),
        genres: BTreeSet::new(),
        tags: BTreeSet::new(),
        file_count: row.try_get::<i64, _>("file_count")? as u32,
        total_file_size: row.try_get::<i64, _>("total_file_size")? as u64,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
        updated_at: row.try_get::<DateTime<Utc>, _>("updated_at")?,
    })
}

/// Find-or-create a `{id, name}` reference row, parameterized throughout.
pub(crate) async fn ensure_named_row(
    conn: &mut SqliteConnection,
    table: &str,
    name: &str,
) -> Result<i64> {
    ensure_row(conn, table, "name", name).await
}

pub(crate) async fn ensure_row(
    conn: &mut SqliteConnection,
    table: &str,
    column: &str,
    value: &str,
) -> Result<i64> {
    // Table and column names come from a fixed in-crate set, never from
    // user input; the value itself is always bound.
    let select = format!("SELECT id FROM {table} WHERE {column} = ?");
    if let Some(row) = sqlx::query(&select)
        .bind(value)
        .fetch_optional(&mut *conn)
        .await?
    {
        return Ok(row.try_get("id")?);
    }
    let insert = format!("INSERT INTO {table} ({column}) VALUES (?)");
    let result = sqlx::query(&insert).bind(value).execute(&mut *conn).await?;
    Ok(result.last_insert_rowid())
}

pub(crate) async fn replace_authors(
    conn: &mut SqliteConnection,
    book_id: BookId,
    authors: &[String],
) -> Result<()> {
    sqlx::query("DELETE FROM book_authors WHERE book_id = ?")
        .bind(book_id.as_i64())
        .execute(&mut *conn)
        .await?;
    for (position, author) in authors.iter().enumerate() {
        let author_id = ensure_named_row(conn, "authors", author).await?;
        sqlx::query(
            "INSERT INTO book_authors (book_id, author_id, position) VALUES (?, ?, ?)",
        )
        .bind(book_id.as_i64())
        .bind(author_id)
        .bind(position as i64)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

pub(crate) async fn replace_set_joins(
    conn: &mut SqliteConnection,
    book_id: BookId,
    ref_table: &str,
    join_table: &str,
    key_column: &str,
    values: &BTreeSet<String>,
) -> Result<()> {
    let delete = format!("DELETE FROM {join_table} WHERE book_id = ?");
    sqlx::query(&delete)
        .bind(book_id.as_i64())
        .execute(&mut *conn)
        .await?;
    for value in values {
        let ref_id = ensure_named_row(conn, ref_table, value).await?;
        let insert = format!(
            "INSERT INTO {join_table} (book_id, {key_column}) VALUES (?, ?)",
        );
        sqlx::query(&insert)
            .bind(book_id.as_i64())
            .bind(ref_id)
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}
