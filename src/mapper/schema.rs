//! Property names in the source and mirror databases.

pub mod task {
    pub const TITLE: &str = "Task";
    pub const STATUS: &str = "Статус";
    pub const PRIORITY: &str = "Приоритет";
    pub const ASSIGNEE: &str = "Исполнитель";
    pub const ESTIMATE: &str = "Оценка";
    pub const DEADLINE: &str = "Дедлайн";
    pub const PARENT: &str = "Родительская задача";
    pub const PRODUCT: &str = "Продукт";
    pub const TAGS: &str = "Теги";
    pub const SUBTASKS: &str = "Подзадачи";
}

pub mod time {
    pub const TOTAL_HOURS: &str = "Всего ч";
    pub const TASK: &str = "Задача";
    pub const WORK_DATE: &str = "Дата работ";
    pub const DESCRIPTION: &str = "Что делали";
    pub const ASSIGNEE: &str = "Исполнитель";
    pub const PROJECT: &str = "Проект";
    pub const TASK_NAME: &str = "Название задачи";
    pub const PROJECT_NAME: &str = "Имя проекта";
    pub const PAID: &str = "Оплата";
    pub const WEEK: &str = "Номер недели";
    pub const MONTH: &str = "Номер месяца";
    pub const DAY: &str = "Номер дня";
    pub const DIRECTION: &str = "Направление";
    pub const PAYABLE_HOURS: &str = "К оплате ч.";
}

pub mod employee {
    pub const NAME: &str = "Имя";
    pub const PERSON: &str = "Ссылка";
    pub const HOURLY_RATE: &str = "Ставка в час";
    pub const DIRECTION: &str = "Направление";
}

pub mod project {
    pub const NAME: &str = "Name";
    pub const STATUS: &str = "Статус";
}

/// Mirror dashboard: one child page per client project, holding the
/// project's databases by title.
pub mod dashboard {
    pub const PROJECTS_DB: &str = "Проекты";
    pub const TASKS_DB: &str = "Задачи";
    pub const TIMES_DB: &str = "Время";
    pub const WORKERS_DB: &str = "Ставки";
    /// Title of a row in the projects database.
    pub const PROJECT_NAME: &str = "Name";
    /// Relation from a project row to its source product.
    pub const INTERNAL: &str = "internal";
}

/// Properties written to the mirror databases.
pub mod mirror {
    pub const NAME: &str = "Name";
    pub const ESTIMATE: &str = "Оценка";
    pub const PROJECT: &str = "Проект";
    pub const STATUS: &str = "Статус";
    pub const PRIORITY: &str = "Приоритет";
    pub const PARENT: &str = "Родительская задача";
    pub const DEADLINE: &str = "Дедлайн";
    pub const ASSIGNEE: &str = "Исполнитель";
    pub const TOTAL_HOURS: &str = "Всего ч";
    pub const TASK: &str = "Задача";
    /// People property of the mirror workers database.
    pub const WORKER_PERSON: &str = "Ссылка";
}
