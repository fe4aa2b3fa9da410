use std::{str::FromStr, time::Duration};

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::{
    migrate::MigrateError,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous},
    Executor, Row, Sqlite, SqlitePool, Transaction,
};
use thiserror::Error;

use course_shop_core::placement::GroupLoad;
use course_shop_core::types::{
    Balance, BalanceId, Course, CourseId, Group, GroupId, GroupMembership, Lesson, Role,
    Subscription, User, UserId, DEFAULT_BALANCE,
};
use course_shop_core::validation::{
    validate_balance, validate_email, validate_link, validate_price, validate_text,
    ValidationError,
};
use course_shop_core::Points;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SQLITE_CONSTRAINT_CHECK: &str = "275";
const SQLITE_CONSTRAINT_FOREIGNKEY: &str = "787";
const SQLITE_CONSTRAINT_UNIQUE: &str = "2067";

/// Top-level database handle that owns the SQLite connection pool.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Establishes a new SQLite connection pool for the provided connection string.
    ///
    /// Pragmas are part of the connect options so every pooled connection gets them.
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(StorageError::Connect)?
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(StorageError::Connect)?;

        Ok(Self { pool })
    }

    /// Applies migrations located under `migrations/`.
    pub async fn run_migrations(&self) -> Result<(), StorageError> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(StorageError::Migration)?;
        Ok(())
    }

    /// Begins a SQLite transaction spanning several repositories.
    pub async fn begin(&self) -> Result<Transaction<'static, Sqlite>, sqlx::Error> {
        self.pool.begin().await
    }

    /// Begins a transaction that already holds the database write lock.
    ///
    /// A deferred transaction that reads first fails with `SQLITE_BUSY` when it
    /// later tries to write after another connection committed, and the busy
    /// timeout does not apply to that upgrade. Writing before any read makes
    /// SQLite take the lock up front, waiting up to the busy timeout.
    pub async fn begin_write(&self) -> Result<Transaction<'static, Sqlite>, sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("UPDATE write_lock SET generation = generation + 1 WHERE id = 1")
            .execute(&mut *tx)
            .await?;
        Ok(tx)
    }

    /// Returns a handle for registering and loading users.
    pub fn users(&self) -> UserRepository {
        UserRepository {
            pool: self.pool.clone(),
        }
    }

    /// Returns a handle for reading and debiting balances.
    pub fn balances(&self) -> BalanceRepository {
        BalanceRepository {
            pool: self.pool.clone(),
        }
    }

    /// Returns a handle for the course catalogue.
    pub fn courses(&self) -> CourseRepository {
        CourseRepository {
            pool: self.pool.clone(),
        }
    }

    /// Returns a handle for course lessons.
    pub fn lessons(&self) -> LessonRepository {
        LessonRepository {
            pool: self.pool.clone(),
        }
    }

    /// Returns a handle for subscriptions.
    pub fn subscriptions(&self) -> SubscriptionRepository {
        SubscriptionRepository {
            pool: self.pool.clone(),
        }
    }

    /// Returns a handle for course groups and their members.
    pub fn groups(&self) -> GroupRepository {
        GroupRepository {
            pool: self.pool.clone(),
        }
    }

    /// Exposes the inner pool when lower level access is required.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// General storage level errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to connect to sqlite: {0}")]
    Connect(sqlx::Error),
    #[error("failed to run database migrations: {0}")]
    Migration(MigrateError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Constraint {
    Unique,
    ForeignKey,
    Check,
}

fn violated_constraint(err: &sqlx::Error) -> Option<Constraint> {
    let sqlx::Error::Database(db_err) = err else {
        return None;
    };
    match db_err.code().as_deref() {
        Some(SQLITE_CONSTRAINT_UNIQUE) => Some(Constraint::Unique),
        Some(SQLITE_CONSTRAINT_FOREIGNKEY) => Some(Constraint::ForeignKey),
        Some(SQLITE_CONSTRAINT_CHECK) => Some(Constraint::Check),
        _ => None,
    }
}

/// Repository used to register and look up users.
#[derive(Clone)]
pub struct UserRepository {
    pool: SqlitePool,
}

impl UserRepository {
    /// Creates a user together with their starting balance.
    pub async fn register(&self, user: &NewUser<'_>) -> Result<RegisteredUser, UserError> {
        validate_email(user.email)?;
        validate_text("username", user.username)?;

        let created_at = to_rfc3339(user.created_at);
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query_as::<_, UserRow>(
            "INSERT INTO users (email, username, first_name, last_name, role, is_staff, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?) \
             RETURNING id, email, username, first_name, last_name, role, is_staff",
        )
        .bind(user.email)
        .bind(user.username)
        .bind(user.first_name)
        .bind(user.last_name)
        .bind(user.role.as_str())
        .bind(user.is_staff)
        .bind(&created_at)
        .fetch_one(&mut *tx)
        .await
        .map_err(|err| match violated_constraint(&err) {
            Some(Constraint::Unique) => UserError::DuplicateEmail,
            _ => UserError::Database(err),
        })?;

        let balance = sqlx::query_as::<_, BalanceRow>(
            "INSERT INTO balances (user_id, amount, updated_at) VALUES (?, ?, ?) \
             RETURNING id, user_id, amount",
        )
        .bind(row.id)
        .bind(DEFAULT_BALANCE.hundredths())
        .bind(&created_at)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(RegisteredUser {
            user: row.into_domain(),
            balance: balance.into_domain(),
        })
    }

    /// Loads a user by id.
    pub async fn fetch(&self, user_id: UserId) -> Result<User, UserError> {
        let row = select_user(&self.pool, user_id)
            .await?
            .ok_or(UserError::NotFound)?;
        Ok(row.into_domain())
    }

    /// Loads a user inside an existing transaction.
    pub async fn fetch_in(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        user_id: UserId,
    ) -> Result<User, UserError> {
        let row = select_user(&mut **tx, user_id)
            .await?
            .ok_or(UserError::NotFound)?;
        Ok(row.into_domain())
    }
}

async fn select_user<'e, E>(executor: E, user_id: UserId) -> Result<Option<UserRow>, sqlx::Error>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query_as::<_, UserRow>(
        "SELECT id, email, username, first_name, last_name, role, is_staff FROM users WHERE id = ?",
    )
    .bind(user_id)
    .fetch_optional(executor)
    .await
}

/// Parameters required to register a user.
pub struct NewUser<'a> {
    pub email: &'a str,
    pub username: &'a str,
    pub first_name: &'a str,
    pub last_name: &'a str,
    pub role: Role,
    pub is_staff: bool,
    pub created_at: DateTime<Utc>,
}

/// Freshly registered user and the balance opened for them.
#[derive(Debug, Clone)]
pub struct RegisteredUser {
    pub user: User,
    pub balance: Balance,
}

#[derive(Debug, sqlx::FromRow)]
struct UserRow {
    id: i64,
    email: String,
    username: String,
    first_name: String,
    last_name: String,
    role: String,
    is_staff: bool,
}

impl UserRow {
    fn into_domain(self) -> User {
        User {
            id: self.id,
            email: self.email,
            username: self.username,
            first_name: self.first_name,
            last_name: self.last_name,
            role: Role::parse(&self.role).unwrap_or_default(),
            is_staff: self.is_staff,
        }
    }
}

/// Errors that can occur while registering or loading users.
#[derive(Debug, Error)]
pub enum UserError {
    #[error("user not found")]
    NotFound,
    #[error("a user with this email already exists")]
    DuplicateEmail,
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Repository for user balances.
#[derive(Clone)]
pub struct BalanceRepository {
    pool: SqlitePool,
}

impl BalanceRepository {
    /// Loads the balance of the provided user.
    pub async fn fetch_for_user(&self, user_id: UserId) -> Result<Balance, BalanceError> {
        let row = select_balance(&self.pool, user_id)
            .await?
            .ok_or(BalanceError::NotFound)?;
        Ok(row.into_domain())
    }

    /// Loads the balance of the provided user inside an existing transaction.
    pub async fn fetch_for_user_in(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        user_id: UserId,
    ) -> Result<Balance, BalanceError> {
        let row = select_balance(&mut **tx, user_id)
            .await?
            .ok_or(BalanceError::NotFound)?;
        Ok(row.into_domain())
    }

    /// Overwrites the amount of a balance. Negative amounts never reach the database.
    pub async fn update_amount(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        balance_id: BalanceId,
        amount: Points,
        updated_at: DateTime<Utc>,
    ) -> Result<(), BalanceError> {
        validate_balance(amount)?;

        let result = sqlx::query("UPDATE balances SET amount = ?, updated_at = ? WHERE id = ?")
            .bind(amount.hundredths())
            .bind(to_rfc3339(updated_at))
            .bind(balance_id)
            .execute(&mut **tx)
            .await
            .map_err(|err| match violated_constraint(&err) {
                Some(Constraint::Check) => {
                    BalanceError::Validation(ValidationError::NegativeBalance)
                }
                _ => BalanceError::Database(err),
            })?;

        if result.rows_affected() == 0 {
            return Err(BalanceError::NotFound);
        }
        Ok(())
    }
}

async fn select_balance<'e, E>(
    executor: E,
    user_id: UserId,
) -> Result<Option<BalanceRow>, sqlx::Error>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query_as::<_, BalanceRow>("SELECT id, user_id, amount FROM balances WHERE user_id = ?")
        .bind(user_id)
        .fetch_optional(executor)
        .await
}

#[derive(Debug, sqlx::FromRow)]
struct BalanceRow {
    id: i64,
    user_id: i64,
    amount: i64,
}

impl BalanceRow {
    fn into_domain(self) -> Balance {
        Balance {
            id: self.id,
            user_id: self.user_id,
            amount: Points::from_hundredths(self.amount),
        }
    }
}

/// Errors that can occur while reading or mutating balances.
#[derive(Debug, Error)]
pub enum BalanceError {
    #[error("balance not found")]
    NotFound,
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Repository for the course catalogue.
#[derive(Clone)]
pub struct CourseRepository {
    pool: SqlitePool,
}

impl CourseRepository {
    /// Inserts a new course after validating title and price.
    pub async fn create(&self, course: &NewCourse<'_>) -> Result<Course, CourseError> {
        validate_text("title", course.title)?;
        validate_price(course.price)?;

        let row = sqlx::query_as::<_, CourseRow>(
            "INSERT INTO courses (author_id, title, start_date, price, created_at) \
             VALUES (?, ?, ?, ?, ?) \
             RETURNING id, author_id, title, start_date, price",
        )
        .bind(course.author_id)
        .bind(course.title)
        .bind(to_rfc3339(course.start_date))
        .bind(course.price.hundredths())
        .bind(to_rfc3339(course.created_at))
        .fetch_one(&self.pool)
        .await
        .map_err(|err| match violated_constraint(&err) {
            Some(Constraint::ForeignKey) => CourseError::AuthorNotFound,
            Some(Constraint::Check) => CourseError::Validation(ValidationError::NegativePrice),
            _ => CourseError::Database(err),
        })?;

        Ok(row.into_domain())
    }

    /// Loads a course by id.
    pub async fn fetch(&self, course_id: CourseId) -> Result<Course, CourseError> {
        let row = select_course(&self.pool, course_id)
            .await?
            .ok_or(CourseError::NotFound)?;
        Ok(row.into_domain())
    }

    /// Loads a course inside an existing transaction.
    pub async fn fetch_in(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        course_id: CourseId,
    ) -> Result<Course, CourseError> {
        let row = select_course(&mut **tx, course_id)
            .await?
            .ok_or(CourseError::NotFound)?;
        Ok(row.into_domain())
    }

    /// Lists the courses the user holds no valid subscription for, newest first.
    pub async fn list_available_for(
        &self,
        user_id: UserId,
    ) -> Result<Vec<CourseListing>, CourseError> {
        let rows = sqlx::query_as::<_, CourseListingRow>(
            r#"
SELECT c.id,
       c.author_id,
       c.title,
       c.start_date,
       c.price,
       (SELECT COUNT(*) FROM lessons AS l WHERE l.course_id = c.id) AS lessons_count
  FROM courses AS c
 WHERE NOT EXISTS (
        SELECT 1
          FROM subscriptions AS s
         WHERE s.course_id = c.id
           AND s.user_id = ?
           AND s.is_valid = 1
       )
 ORDER BY c.id DESC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(CourseListingRow::into_domain).collect())
    }
}

async fn select_course<'e, E>(
    executor: E,
    course_id: CourseId,
) -> Result<Option<CourseRow>, sqlx::Error>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query_as::<_, CourseRow>(
        "SELECT id, author_id, title, start_date, price FROM courses WHERE id = ?",
    )
    .bind(course_id)
    .fetch_optional(executor)
    .await
}

/// Parameters required to insert a course.
pub struct NewCourse<'a> {
    pub author_id: UserId,
    pub title: &'a str,
    pub start_date: DateTime<Utc>,
    pub price: Points,
    pub created_at: DateTime<Utc>,
}

/// Course annotated with its number of lessons.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CourseListing {
    pub course: Course,
    pub lessons_count: u32,
}

#[derive(Debug, sqlx::FromRow)]
struct CourseRow {
    id: i64,
    author_id: i64,
    title: String,
    start_date: DateTime<Utc>,
    price: i64,
}

impl CourseRow {
    fn into_domain(self) -> Course {
        Course {
            id: self.id,
            author_id: self.author_id,
            title: self.title,
            start_date: self.start_date,
            price: Points::from_hundredths(self.price),
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct CourseListingRow {
    id: i64,
    author_id: i64,
    title: String,
    start_date: DateTime<Utc>,
    price: i64,
    lessons_count: i64,
}

impl CourseListingRow {
    fn into_domain(self) -> CourseListing {
        CourseListing {
            course: Course {
                id: self.id,
                author_id: self.author_id,
                title: self.title,
                start_date: self.start_date,
                price: Points::from_hundredths(self.price),
            },
            lessons_count: self.lessons_count as u32,
        }
    }
}

/// Errors that can occur while reading or writing courses.
#[derive(Debug, Error)]
pub enum CourseError {
    #[error("course not found")]
    NotFound,
    #[error("course author does not exist")]
    AuthorNotFound,
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Repository for course lessons.
#[derive(Clone)]
pub struct LessonRepository {
    pool: SqlitePool,
}

impl LessonRepository {
    /// Adds a lesson to a course.
    pub async fn create(&self, lesson: &NewLesson<'_>) -> Result<Lesson, LessonError> {
        validate_text("title", lesson.title)?;
        validate_link(lesson.link)?;

        let row = sqlx::query(
            "INSERT INTO lessons (course_id, title, link) VALUES (?, ?, ?) RETURNING id",
        )
        .bind(lesson.course_id)
        .bind(lesson.title)
        .bind(lesson.link)
        .fetch_one(&self.pool)
        .await
        .map_err(|err| match violated_constraint(&err) {
            Some(Constraint::ForeignKey) => LessonError::CourseNotFound,
            _ => LessonError::Database(err),
        })?;

        Ok(Lesson {
            id: row.get("id"),
            course_id: lesson.course_id,
            title: lesson.title.to_string(),
            link: lesson.link.to_string(),
        })
    }

    /// Lists the lessons of a course in creation order.
    pub async fn list_for_course(&self, course_id: CourseId) -> Result<Vec<Lesson>, LessonError> {
        let rows = sqlx::query_as::<_, LessonRow>(
            "SELECT id, course_id, title, link FROM lessons WHERE course_id = ? ORDER BY id",
        )
        .bind(course_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| Lesson {
                id: row.id,
                course_id: row.course_id,
                title: row.title,
                link: row.link,
            })
            .collect())
    }
}

/// Parameters required to insert a lesson.
pub struct NewLesson<'a> {
    pub course_id: CourseId,
    pub title: &'a str,
    pub link: &'a str,
}

#[derive(Debug, sqlx::FromRow)]
struct LessonRow {
    id: i64,
    course_id: i64,
    title: String,
    link: String,
}

/// Errors that can occur while reading or writing lessons.
#[derive(Debug, Error)]
pub enum LessonError {
    #[error("course not found")]
    CourseNotFound,
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Repository for subscriptions.
#[derive(Clone)]
pub struct SubscriptionRepository {
    pool: SqlitePool,
}

impl SubscriptionRepository {
    /// Looks up the subscription of a user to a course inside an existing transaction.
    pub async fn find_in(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        user_id: UserId,
        course_id: CourseId,
    ) -> Result<Option<Subscription>, SubscriptionError> {
        let row = select_subscription(&mut **tx, user_id, course_id).await?;
        Ok(row.map(SubscriptionRow::into_domain))
    }

    /// Looks up the subscription of a user to a course.
    pub async fn find(
        &self,
        user_id: UserId,
        course_id: CourseId,
    ) -> Result<Option<Subscription>, SubscriptionError> {
        let row = select_subscription(&self.pool, user_id, course_id).await?;
        Ok(row.map(SubscriptionRow::into_domain))
    }

    /// Inserts a subscription. The `(user, course)` pair is unique.
    pub async fn insert(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        subscription: &NewSubscription,
    ) -> Result<Subscription, SubscriptionError> {
        let row = sqlx::query_as::<_, SubscriptionRow>(
            "INSERT INTO subscriptions (user_id, course_id, is_valid, created_at) \
             VALUES (?, ?, ?, ?) \
             RETURNING id, user_id, course_id, is_valid",
        )
        .bind(subscription.user_id)
        .bind(subscription.course_id)
        .bind(subscription.is_valid)
        .bind(to_rfc3339(subscription.created_at))
        .fetch_one(&mut **tx)
        .await
        .map_err(|err| match violated_constraint(&err) {
            Some(Constraint::Unique) => SubscriptionError::Duplicate,
            Some(Constraint::ForeignKey) => SubscriptionError::MissingReference,
            _ => SubscriptionError::Database(err),
        })?;

        Ok(row.into_domain())
    }
}

async fn select_subscription<'e, E>(
    executor: E,
    user_id: UserId,
    course_id: CourseId,
) -> Result<Option<SubscriptionRow>, sqlx::Error>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query_as::<_, SubscriptionRow>(
        "SELECT id, user_id, course_id, is_valid FROM subscriptions \
         WHERE user_id = ? AND course_id = ?",
    )
    .bind(user_id)
    .bind(course_id)
    .fetch_optional(executor)
    .await
}

/// Parameters required to insert a subscription.
pub struct NewSubscription {
    pub user_id: UserId,
    pub course_id: CourseId,
    pub is_valid: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, sqlx::FromRow)]
struct SubscriptionRow {
    id: i64,
    user_id: i64,
    course_id: i64,
    is_valid: bool,
}

impl SubscriptionRow {
    fn into_domain(self) -> Subscription {
        Subscription {
            id: self.id,
            user_id: self.user_id,
            course_id: self.course_id,
            is_valid: self.is_valid,
        }
    }
}

/// Errors that can occur while reading or writing subscriptions.
#[derive(Debug, Error)]
pub enum SubscriptionError {
    #[error("subscription for this user and course already exists")]
    Duplicate,
    #[error("subscription references a missing user or course")]
    MissingReference,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Repository for course groups and their members.
#[derive(Clone)]
pub struct GroupRepository {
    pool: SqlitePool,
}

impl GroupRepository {
    /// Creates a group outside of placement, e.g. from the admin API.
    pub async fn create(&self, group: &NewGroup<'_>) -> Result<Group, GroupError> {
        validate_text("title", group.title)?;
        let row = insert_group(&self.pool, group).await?;
        Ok(row.into_domain())
    }

    /// Creates a group inside an existing transaction.
    pub async fn create_in(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        group: &NewGroup<'_>,
    ) -> Result<Group, GroupError> {
        validate_text("title", group.title)?;
        let row = insert_group(&mut **tx, group).await?;
        Ok(row.into_domain())
    }

    /// Lists the groups of a course, least populated first, ties by id.
    pub async fn list_for_course(&self, course_id: CourseId) -> Result<Vec<Group>, GroupError> {
        let rows = sqlx::query_as::<_, GroupRow>(
            "SELECT id, course_id, title, count_students FROM course_groups \
             WHERE course_id = ? ORDER BY count_students ASC, id ASC",
        )
        .bind(course_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(GroupRow::into_domain).collect())
    }

    /// Loads the population of every group of a course inside an existing transaction.
    pub async fn loads_in(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        course_id: CourseId,
    ) -> Result<Vec<GroupLoad>, GroupError> {
        let rows = sqlx::query(
            "SELECT id, count_students FROM course_groups \
             WHERE course_id = ? ORDER BY count_students ASC, id ASC",
        )
        .bind(course_id)
        .fetch_all(&mut **tx)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| {
                let count: i64 = row.get("count_students");
                GroupLoad {
                    group_id: row.get("id"),
                    count_students: count as u32,
                }
            })
            .collect())
    }

    /// Sets the counter of a group, returning the stored value.
    pub async fn set_count_in(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        group_id: GroupId,
        count_students: u32,
    ) -> Result<u32, GroupError> {
        let row = sqlx::query(
            "UPDATE course_groups SET count_students = ? WHERE id = ? RETURNING count_students",
        )
        .bind(i64::from(count_students))
        .bind(group_id)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or(GroupError::NotFound)?;

        let count: i64 = row.get("count_students");
        Ok(count as u32)
    }

    /// Atomically increments the counter of a group, returning the new value.
    pub async fn increment_in(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        group_id: GroupId,
    ) -> Result<u32, GroupError> {
        let row = sqlx::query(
            "UPDATE course_groups SET count_students = count_students + 1 \
             WHERE id = ? RETURNING count_students",
        )
        .bind(group_id)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or(GroupError::NotFound)?;

        let count: i64 = row.get("count_students");
        Ok(count as u32)
    }

    /// Records that a user belongs to a group. The `(user, group)` pair is unique.
    pub async fn add_member_in(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        group_id: GroupId,
        user_id: UserId,
        joined_at: DateTime<Utc>,
    ) -> Result<GroupMembership, GroupError> {
        let row = sqlx::query(
            "INSERT INTO group_students (group_id, user_id, created_at) VALUES (?, ?, ?) \
             RETURNING id",
        )
        .bind(group_id)
        .bind(user_id)
        .bind(to_rfc3339(joined_at))
        .fetch_one(&mut **tx)
        .await
        .map_err(|err| match violated_constraint(&err) {
            Some(Constraint::Unique) => GroupError::DuplicateMember,
            Some(Constraint::ForeignKey) => GroupError::NotFound,
            _ => GroupError::Database(err),
        })?;

        Ok(GroupMembership {
            id: row.get("id"),
            group_id,
            user_id,
        })
    }

    /// Lists every membership across the groups of a course.
    pub async fn members_for_course(
        &self,
        course_id: CourseId,
    ) -> Result<Vec<GroupMembership>, GroupError> {
        let rows = sqlx::query_as::<_, MembershipRow>(
            "SELECT gs.id, gs.group_id, gs.user_id \
               FROM group_students AS gs \
               JOIN course_groups AS g ON g.id = gs.group_id \
              WHERE g.course_id = ? \
              ORDER BY gs.id",
        )
        .bind(course_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| GroupMembership {
                id: row.id,
                group_id: row.group_id,
                user_id: row.user_id,
            })
            .collect())
    }
}

async fn insert_group<'e, E>(executor: E, group: &NewGroup<'_>) -> Result<GroupRow, GroupError>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query_as::<_, GroupRow>(
        "INSERT INTO course_groups (course_id, title, count_students, created_at) \
         VALUES (?, ?, ?, ?) \
         RETURNING id, course_id, title, count_students",
    )
    .bind(group.course_id)
    .bind(group.title)
    .bind(i64::from(group.count_students))
    .bind(to_rfc3339(group.created_at))
    .fetch_one(executor)
    .await
    .map_err(|err| match violated_constraint(&err) {
        Some(Constraint::ForeignKey) => GroupError::CourseNotFound,
        _ => GroupError::Database(err),
    })
}

/// Parameters required to insert a group.
pub struct NewGroup<'a> {
    pub course_id: CourseId,
    pub title: &'a str,
    pub count_students: u32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, sqlx::FromRow)]
struct GroupRow {
    id: i64,
    course_id: i64,
    title: String,
    count_students: i64,
}

impl GroupRow {
    fn into_domain(self) -> Group {
        Group {
            id: self.id,
            course_id: self.course_id,
            title: self.title,
            count_students: self.count_students as u32,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct MembershipRow {
    id: i64,
    group_id: i64,
    user_id: i64,
}

/// Errors that can occur while mutating groups.
#[derive(Debug, Error)]
pub enum GroupError {
    #[error("course not found")]
    CourseNotFound,
    #[error("group not found")]
    NotFound,
    #[error("student is already a member of this group")]
    DuplicateMember,
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

fn to_rfc3339(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tempfile::TempDir;

    async fn setup_db() -> (TempDir, Database) {
        let dir = tempfile::tempdir().expect("temp dir");
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("shop.db").display());
        let db = Database::connect(&url).await.expect("connect");
        db.run_migrations().await.expect("migrations");
        (dir, db)
    }

    async fn register(db: &Database, email: &str) -> RegisteredUser {
        db.users()
            .register(&NewUser {
                email,
                username: "student",
                first_name: "Ada",
                last_name: "Lovelace",
                role: Role::Student,
                is_staff: false,
                created_at: Utc::now(),
            })
            .await
            .expect("register user")
    }

    async fn course(db: &Database, author_id: UserId, price: &str) -> Course {
        db.courses()
            .create(&NewCourse {
                author_id,
                title: "Rust for backends",
                start_date: Utc::now() + Duration::days(30),
                price: price.parse().expect("price"),
                created_at: Utc::now(),
            })
            .await
            .expect("create course")
    }

    #[tokio::test]
    async fn migrations_apply() {
        let (_dir, db) = setup_db().await;
        let tables: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM sqlite_master WHERE type = 'table'")
                .fetch_one(db.pool())
                .await
                .expect("fetch tables");
        assert!(tables.0 >= 8, "expected core tables to be created");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn write_transactions_wait_for_each_other() {
        let (_dir, db) = setup_db().await;
        let user = register(&db, "ada@example.com").await;

        let mut first = db.begin_write().await.expect("first writer");
        let balance = db
            .balances()
            .fetch_for_user_in(&mut first, user.user.id)
            .await
            .expect("balance");

        let second_db = db.clone();
        let user_id = user.user.id;
        let second = tokio::spawn(async move {
            let mut tx = second_db.begin_write().await?;
            let balance = second_db
                .balances()
                .fetch_for_user_in(&mut tx, user_id)
                .await
                .expect("balance");
            tx.commit().await?;
            Ok::<_, sqlx::Error>(balance.amount)
        });

        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert!(!second.is_finished(), "second writer must wait for the lock");

        db.balances()
            .update_amount(&mut first, balance.id, Points::whole(900), Utc::now())
            .await
            .expect("debit");
        first.commit().await.expect("commit");

        let seen = second.await.expect("join").expect("second writer");
        assert_eq!(seen, Points::whole(900));
    }

    #[tokio::test]
    async fn registration_opens_default_balance() {
        let (_dir, db) = setup_db().await;
        let registered = register(&db, "ada@example.com").await;
        assert_eq!(registered.balance.amount, DEFAULT_BALANCE);

        let balance = db
            .balances()
            .fetch_for_user(registered.user.id)
            .await
            .expect("balance");
        assert_eq!(balance.amount.to_string(), "1000.00");
    }

    #[tokio::test]
    async fn duplicate_email_is_rejected() {
        let (_dir, db) = setup_db().await;
        register(&db, "ada@example.com").await;
        let err = db
            .users()
            .register(&NewUser {
                email: "ada@example.com",
                username: "other",
                first_name: "",
                last_name: "",
                role: Role::Teacher,
                is_staff: false,
                created_at: Utc::now(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, UserError::DuplicateEmail));
    }

    #[tokio::test]
    async fn negative_price_is_rejected_before_insert() {
        let (_dir, db) = setup_db().await;
        let author = register(&db, "teacher@example.com").await;
        let err = db
            .courses()
            .create(&NewCourse {
                author_id: author.user.id,
                title: "Broken",
                start_date: Utc::now(),
                price: Points::from_hundredths(-1),
                created_at: Utc::now(),
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CourseError::Validation(ValidationError::NegativePrice)
        ));

        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM courses")
            .fetch_one(db.pool())
            .await
            .expect("count");
        assert_eq!(count.0, 0);
    }

    #[tokio::test]
    async fn course_round_trips_price_and_start_date() {
        let (_dir, db) = setup_db().await;
        let author = register(&db, "teacher@example.com").await;
        let created = course(&db, author.user.id, "199.99").await;
        let loaded = db.courses().fetch(created.id).await.expect("fetch");
        assert_eq!(loaded.price.to_string(), "199.99");
        assert_eq!(
            loaded.start_date.timestamp_millis(),
            created.start_date.timestamp_millis()
        );
        assert!(matches!(
            db.courses().fetch(created.id + 1).await,
            Err(CourseError::NotFound)
        ));
    }

    #[tokio::test]
    async fn negative_balance_is_never_written() {
        let (_dir, db) = setup_db().await;
        let user = register(&db, "ada@example.com").await;
        let mut tx = db.begin().await.expect("begin");
        let err = db
            .balances()
            .update_amount(
                &mut tx,
                user.balance.id,
                Points::from_hundredths(-50),
                Utc::now(),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            BalanceError::Validation(ValidationError::NegativeBalance)
        ));
    }

    #[tokio::test]
    async fn available_courses_exclude_valid_subscriptions() {
        let (_dir, db) = setup_db().await;
        let user = register(&db, "ada@example.com").await;
        let bought = course(&db, user.user.id, "10.00").await;
        let pending = course(&db, user.user.id, "20.00").await;
        let fresh = course(&db, user.user.id, "30.00").await;

        db.lessons()
            .create(&NewLesson {
                course_id: fresh.id,
                title: "Intro",
                link: "https://example.com/intro",
            })
            .await
            .expect("lesson");

        let mut tx = db.begin().await.expect("begin");
        for (course_id, is_valid) in [(bought.id, true), (pending.id, false)] {
            db.subscriptions()
                .insert(
                    &mut tx,
                    &NewSubscription {
                        user_id: user.user.id,
                        course_id,
                        is_valid,
                        created_at: Utc::now(),
                    },
                )
                .await
                .expect("subscription");
        }
        tx.commit().await.expect("commit");

        let listings = db
            .courses()
            .list_available_for(user.user.id)
            .await
            .expect("list");
        let ids: Vec<_> = listings.iter().map(|item| item.course.id).collect();
        assert_eq!(ids, vec![fresh.id, pending.id]);
        assert_eq!(listings[0].lessons_count, 1);
        assert_eq!(listings[1].lessons_count, 0);
    }

    #[tokio::test]
    async fn duplicate_subscription_hits_unique_constraint() {
        let (_dir, db) = setup_db().await;
        let user = register(&db, "ada@example.com").await;
        let course = course(&db, user.user.id, "10.00").await;
        let new = NewSubscription {
            user_id: user.user.id,
            course_id: course.id,
            is_valid: true,
            created_at: Utc::now(),
        };

        let mut tx = db.begin().await.expect("begin");
        db.subscriptions()
            .insert(&mut tx, &new)
            .await
            .expect("first insert");
        let err = db.subscriptions().insert(&mut tx, &new).await.unwrap_err();
        assert!(matches!(err, SubscriptionError::Duplicate));
    }

    #[tokio::test]
    async fn groups_are_listed_least_populated_first() {
        let (_dir, db) = setup_db().await;
        let user = register(&db, "ada@example.com").await;
        let course = course(&db, user.user.id, "10.00").await;
        let repo = db.groups();

        let mut tx = db.begin().await.expect("begin");
        for (title, count) in [("A", 3), ("B", 1), ("C", 1)] {
            repo.create_in(
                &mut tx,
                &NewGroup {
                    course_id: course.id,
                    title,
                    count_students: count,
                    created_at: Utc::now(),
                },
            )
            .await
            .expect("group");
        }
        tx.commit().await.expect("commit");

        let titles: Vec<_> = repo
            .list_for_course(course.id)
            .await
            .expect("list")
            .into_iter()
            .map(|group| group.title)
            .collect();
        assert_eq!(titles, vec!["B", "C", "A"]);
    }

    #[tokio::test]
    async fn increment_and_membership_are_tracked() {
        let (_dir, db) = setup_db().await;
        let user = register(&db, "ada@example.com").await;
        let course = course(&db, user.user.id, "10.00").await;
        let repo = db.groups();
        let group = repo
            .create(&NewGroup {
                course_id: course.id,
                title: "Group 1",
                count_students: 0,
                created_at: Utc::now(),
            })
            .await
            .expect("group");

        let mut tx = db.begin().await.expect("begin");
        assert_eq!(repo.set_count_in(&mut tx, group.id, 1).await.unwrap(), 1);
        assert_eq!(repo.increment_in(&mut tx, group.id).await.unwrap(), 2);
        repo.add_member_in(&mut tx, group.id, user.user.id, Utc::now())
            .await
            .expect("member");
        let err = repo
            .add_member_in(&mut tx, group.id, user.user.id, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, GroupError::DuplicateMember));
        tx.commit().await.expect("commit");

        let members = repo.members_for_course(course.id).await.expect("members");
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].user_id, user.user.id);
    }

    #[tokio::test]
    async fn group_for_missing_course_is_rejected() {
        let (_dir, db) = setup_db().await;
        let err = db
            .groups()
            .create(&NewGroup {
                course_id: 404,
                title: "Group 1",
                count_students: 0,
                created_at: Utc::now(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, GroupError::CourseNotFound));
    }
}
